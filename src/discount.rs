//! Discount rule evaluation.
//!
//! Rules come from the backend as reference data; the checkout flow asks two
//! questions of them: is the rule current, and how much does it take off a
//! given price. Per-product rules apply to each matching line item;
//! on-total rules apply once to the transaction total.

use chrono::{DateTime, Utc};

use crate::models::{Discount, DiscountScope, DiscountValueType};

impl Discount {
    /// Whether the rule is active and `now` falls inside its date window.
    pub fn is_current(&self, now: DateTime<Utc>) -> bool {
        self.is_active && now >= self.start_date && now <= self.end_date
    }

    /// Amount taken off `price` by this rule. Never exceeds the price and
    /// never goes negative.
    pub fn amount_off(&self, price: f64) -> f64 {
        if price <= 0.0 {
            return 0.0;
        }
        let raw = match self.value_type {
            DiscountValueType::Percentage => price * self.value / 100.0,
            DiscountValueType::Fixed => self.value,
        };
        raw.clamp(0.0, price)
    }

    pub fn applies_per_product(&self) -> bool {
        self.scope == DiscountScope::PerProduct
    }
}

/// Total after applying every currently valid on-total rule in `rules`.
pub fn discounted_total(total: f64, rules: &[Discount], now: DateTime<Utc>) -> f64 {
    let mut remaining = total;
    for rule in rules {
        if rule.scope == DiscountScope::OnTotal && rule.is_current(now) {
            remaining -= rule.amount_off(remaining);
        }
    }
    remaining.max(0.0)
}

// ===========================================================================
// Tests
// ===========================================================================
