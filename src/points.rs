//! Loyalty and credit-note point redemption for the sale being built.
//!
//! A `PointsLedger` is an explicit value object the checkout flow constructs
//! per sale and passes into `create_transaction` — never process-wide state,
//! so one sale's redemption can never leak into the next. The receipt layer
//! reads points used from the ledger and points gained from
//! `points_earned`.

use serde::{Deserialize, Serialize};

use crate::models::Customer;

/// Fraction of the pre-redemption subtotal granted as new loyalty points.
const EARN_RATE: f64 = 0.02;

/// Points the operator chose to redeem for the current sale, plus the
/// customer balances that will result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsLedger {
    /// Loyalty points redeemed on this sale.
    pub loyalty_points: f64,
    /// Credit-note points redeemed on this sale.
    pub credit_note_points: f64,
    /// Customer loyalty balance after redemption.
    pub new_loyalty_points: f64,
    /// Customer credit-note balance after redemption.
    pub new_credit_note_points: f64,
}

impl PointsLedger {
    /// Build a ledger redeeming the given amounts against a customer's
    /// current balances. Redemption is clamped to what the customer has.
    pub fn redeem_from(customer: &Customer, loyalty: f64, credit_note: f64) -> Self {
        let loyalty = loyalty.clamp(0.0, customer.loyalty_points);
        let credit_note = credit_note.clamp(0.0, customer.credit_note_balance);
        Self {
            loyalty_points: loyalty,
            credit_note_points: credit_note,
            new_loyalty_points: customer.loyalty_points - loyalty,
            new_credit_note_points: customer.credit_note_balance - credit_note,
        }
    }

    /// Reset all four amounts to zero. Called after a receipt is finalized.
    pub fn clear_points(&mut self) {
        *self = Self::default();
    }

    /// Total monetary value the redemption covers.
    pub fn redeemed_total(&self) -> f64 {
        self.loyalty_points + self.credit_note_points
    }
}

/// Points gained on a sale: 2% of the pre-redemption subtotal.
pub fn points_earned(subtotal: f64) -> f64 {
    (subtotal.max(0.0) * EARN_RATE * 100.0).round() / 100.0
}

// ===========================================================================
// Tests
// ===========================================================================
