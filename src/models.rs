//! Entity types shared between the local store, the sync engine, and the
//! remote backend wire format.
//!
//! Wire names are camelCase to match the backend's JSON; local SQLite column
//! names stay snake_case (mapping happens in `data.rs`). Transactions are
//! immutable after creation except for the `synced` flag.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A catalog product, scoped to one session partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: String,
    pub product_code: String,
    /// Barcode; unique within a session.
    pub ean: String,
    pub product_name: String,
    #[serde(default)]
    pub brand_name: String,
    #[serde(default)]
    pub brand_id: String,
    pub retail_price: f64,
    /// Never negative; mutated only through the atomic decrement.
    pub available_quantity: i64,
    #[serde(default)]
    pub size: String,
    #[serde(default)]
    pub color: String,
    /// Last time this row was written by a remote pull (RFC 3339).
    #[serde(default)]
    pub last_sync_at: Option<String>,
    /// Local-only edits not yet reconciled with a remote pull.
    #[serde(default)]
    pub is_modified: bool,
}

/// A customer, looked up by phone number; created on first reference.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Customer {
    pub id: String,
    pub firstname: String,
    #[serde(default)]
    pub lastname: String,
    #[serde(default)]
    pub email: String,
    /// Natural key within a session.
    pub phoneno: String,
    #[serde(default)]
    pub gender: String,
    #[serde(default)]
    pub age: Option<i64>,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub loyalty_points: f64,
    #[serde(default)]
    pub credit_note_balance: f64,
}

/// One sold line item: a snapshot of the product at sale time plus the
/// quantity and line price. Stored as JSON inside the transaction row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TransactionItem {
    pub ean: String,
    pub product_code: String,
    pub product_name: String,
    pub retail_price: f64,
    pub quantity: i64,
    pub total_price: f64,
    #[serde(default)]
    pub discount: Option<f64>,
}

/// A payment split (method name + amount tendered).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSplit {
    pub method: String,
    pub amount: f64,
}

/// A completed sale. Immutable once created except for `synced`, which
/// transitions only `"false"` -> `"true"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub created_at: String,
    pub receipt_no: String,
    pub total_amount: f64,
    pub original_total: f64,
    pub payment_methods: Vec<PaymentSplit>,
    pub items: Vec<TransactionItem>,
    #[serde(default)]
    pub customer_phoneno: Option<String>,
    #[serde(default)]
    pub loyalty_points: f64,
    #[serde(default)]
    pub credit_note_points: f64,
    #[serde(default)]
    pub discount: f64,
    pub status: String,
    pub synced: String,
    pub session_id: String,
}

/// Operator input for a new sale — everything `create_transaction` needs
/// apart from the generated id, receipt number, and timestamps.
#[derive(Debug, Clone, Default)]
pub struct TransactionDraft {
    pub items: Vec<TransactionItem>,
    pub payment_methods: Vec<PaymentSplit>,
    pub total_amount: f64,
    pub original_total: f64,
    pub discount: f64,
    pub status: String,
    /// Phone number of the customer, if one is attached to the sale.
    pub customer_phoneno: Option<String>,
    /// Customer first name, used when the customer is created on first
    /// reference.
    pub customer_firstname: Option<String>,
}

/// Scope of a discount rule.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DiscountScope {
    #[serde(rename = "discountPerProduct")]
    PerProduct,
    #[serde(rename = "discountOnTotal")]
    OnTotal,
}

/// How a discount's `value` is interpreted.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DiscountValueType {
    Percentage,
    Fixed,
}

/// A named discount rule pulled from the backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Discount {
    pub id: String,
    pub code: String,
    pub value: f64,
    pub value_type: DiscountValueType,
    #[serde(rename = "type")]
    pub scope: DiscountScope,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub is_active: bool,
}

/// Reference data pulled from the backend; read-only locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PaymentMethod {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_active: bool,
}

/// Reference data pulled from the backend; read-only locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub address: String,
}

/// A transaction the backend rejected during sync, retained for operator
/// review. Never retried automatically.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FailedSyncTransaction {
    pub id: String,
    pub session_id: String,
    /// Full JSON snapshot of the rejected transaction.
    pub payload: serde_json::Value,
    pub error_message: String,
    pub failed_at: String,
}
