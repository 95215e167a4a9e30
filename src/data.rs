//! Session-scoped data access over the local store.
//!
//! `LocalDataAccess` is the façade the checkout flow and the sync engine go
//! through: product lookups, the atomic quantity decrement, transaction
//! creation, sync-flag bookkeeping, and the bulk deletes logout performs.
//! Every query filters on the handle's session id, so two sessions never see
//! each other's rows.
//!
//! Atomicity: `create_transaction` applies all product decrements and the
//! transaction insert inside one SQL transaction — if any line item cannot
//! be decremented, nothing from that unit persists. The customer
//! loyalty/credit-note upsert commits *before* that unit and is not rolled
//! back when the unit fails; see DESIGN.md.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::PosError;
use crate::models::{
    Branch, Customer, Discount, FailedSyncTransaction, PaymentMethod, Product, Transaction,
    TransactionDraft,
};
use crate::points::PointsLedger;

const RECEIPT_CATEGORY: &str = "transactions";
const RECEIPT_COUNTER_KEY: &str = "receipt_counter";

/// All local collections, reloaded in one call for display refreshes.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalSnapshot {
    pub products: Vec<Product>,
    pub customers: Vec<Customer>,
    pub transactions: Vec<Transaction>,
    pub payment_methods: Vec<PaymentMethod>,
    pub discounts: Vec<Discount>,
    pub branches: Vec<Branch>,
    pub failed_sync_transactions: Vec<FailedSyncTransaction>,
}

/// Session-scoped façade over the shared store.
pub struct LocalDataAccess {
    db: Arc<DbState>,
    session_id: String,
}

/// Caches one `LocalDataAccess` handle per session id so repeated lookups
/// reuse the same handle (the store itself is shared process-wide).
pub struct StoreRegistry {
    db: Arc<DbState>,
    handles: Mutex<HashMap<String, Arc<LocalDataAccess>>>,
}

impl StoreRegistry {
    pub fn new(db: Arc<DbState>) -> Self {
        Self {
            db,
            handles: Mutex::new(HashMap::new()),
        }
    }

    /// Get (or create and cache) the handle for a session.
    pub fn data_for(&self, session_id: &str) -> Arc<LocalDataAccess> {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(LocalDataAccess::new(self.db.clone(), session_id.to_string()))
            })
            .clone()
    }

    /// Drop the cached handle for a session (after logout cleanup).
    pub fn evict(&self, session_id: &str) {
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        handles.remove(session_id);
    }
}

impl LocalDataAccess {
    pub fn new(db: Arc<DbState>, session_id: String) -> Self {
        Self { db, session_id }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    // -----------------------------------------------------------------------
    // Products
    // -----------------------------------------------------------------------

    /// All products in this session.
    pub fn all_products(&self) -> Result<Vec<Product>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, product_code, ean, product_name, brand_name, brand_id,
                    retail_price, available_quantity, size, color, last_sync_at, is_modified
             FROM products WHERE session_id = ?1 ORDER BY product_name",
        )?;
        let rows = stmt.query_map(params![self.session_id], map_product)?;
        collect_rows(rows, "product")
    }

    /// Products matching a SKU.
    pub fn products_by_code(&self, code: &str) -> Result<Vec<Product>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, product_code, ean, product_name, brand_name, brand_id,
                    retail_price, available_quantity, size, color, last_sync_at, is_modified
             FROM products WHERE session_id = ?1 AND product_code = ?2",
        )?;
        let rows = stmt.query_map(params![self.session_id, code], map_product)?;
        collect_rows(rows, "product")
    }

    /// Single product by barcode, if present in this session.
    pub fn product_by_ean(&self, ean: &str) -> Result<Option<Product>, PosError> {
        let conn = self.db.lock()?;
        let product = conn
            .query_row(
                "SELECT id, product_code, ean, product_name, brand_name, brand_id,
                        retail_price, available_quantity, size, color, last_sync_at, is_modified
                 FROM products WHERE session_id = ?1 AND ean = ?2",
                params![self.session_id, ean],
                map_product,
            )
            .optional()?;
        Ok(product)
    }

    /// Atomically decrement a product's stock by `delta`.
    ///
    /// Fails with `InsufficientStock` when the decrement would drive
    /// `available_quantity` negative, leaving the row unchanged, and with
    /// `ProductNotFound` when the ean has no row in this session. Marks the
    /// row locally modified on success.
    pub fn update_product_quantity(&self, ean: &str, delta: i64) -> Result<(), PosError> {
        let conn = self.db.lock()?;
        decrement_product(&conn, &self.session_id, ean, delta)
    }

    /// Optimistic UI-side quantity preview; distinct from the store-level
    /// decrement and never persisted.
    pub fn preview_quantity(current: i64, delta: i64) -> i64 {
        (current - delta).max(0)
    }

    /// Insert or overwrite a product row from the remote catalog.
    /// Remote always wins: local `is_modified` edits are discarded and the
    /// row's `last_sync_at` is stamped with the pull time.
    pub fn upsert_product_from_remote(&self, product: &Product) -> Result<(), PosError> {
        let conn = self.db.lock()?;
        upsert_product_from_remote(&conn, &self.session_id, product)
    }

    // -----------------------------------------------------------------------
    // Customers
    // -----------------------------------------------------------------------

    pub fn all_customers(&self) -> Result<Vec<Customer>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, firstname, lastname, email, phoneno, gender, age,
                    country, state, city, address, loyalty_points, credit_note_balance
             FROM customers WHERE session_id = ?1 ORDER BY firstname",
        )?;
        let rows = stmt.query_map(params![self.session_id], map_customer)?;
        collect_rows(rows, "customer")
    }

    /// Look a customer up by phone number (the natural key in a session).
    pub fn customer_by_phone(&self, phoneno: &str) -> Result<Option<Customer>, PosError> {
        let conn = self.db.lock()?;
        let customer = conn
            .query_row(
                "SELECT id, firstname, lastname, email, phoneno, gender, age,
                        country, state, city, address, loyalty_points, credit_note_balance
                 FROM customers WHERE session_id = ?1 AND phoneno = ?2",
                params![self.session_id, phoneno],
                map_customer,
            )
            .optional()?;
        Ok(customer)
    }

    /// Insert or overwrite a customer row (remote pulls and local upserts).
    pub fn upsert_customer(&self, customer: &Customer) -> Result<(), PosError> {
        let conn = self.db.lock()?;
        upsert_customer(&conn, &self.session_id, customer)
    }

    // -----------------------------------------------------------------------
    // Transactions
    // -----------------------------------------------------------------------

    /// Create a sale.
    ///
    /// 1. Generates the transaction id and receipt number.
    /// 2. Upserts the customer's point balances from the redemption ledger
    ///    (created on first reference, looked up by phone number). This step
    ///    commits before the atomic unit below and survives its failure.
    /// 3. In one SQL transaction: decrements every line item's product and
    ///    inserts the transaction row with `synced='false'`.
    ///
    /// Any decrement failure aborts the whole unit with `TransactionFailed`
    /// wrapping the cause — no product decrement and no transaction row from
    /// this call persist.
    pub fn create_transaction(
        &self,
        draft: &TransactionDraft,
        redemption: &PointsLedger,
    ) -> Result<String, PosError> {
        let mut conn = self.db.lock()?;

        let transaction_id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let receipt_no = next_receipt_number(&conn);

        // Customer balance upsert, outside the atomic unit below.
        if let Some(phoneno) = draft.customer_phoneno.as_deref() {
            self.apply_redemption(&conn, phoneno, draft, redemption)?;
        }

        let status = if draft.status.is_empty() {
            "completed"
        } else {
            draft.status.as_str()
        };
        let items_json =
            serde_json::to_string(&draft.items).unwrap_or_else(|_| "[]".to_string());
        let payments_json =
            serde_json::to_string(&draft.payment_methods).unwrap_or_else(|_| "[]".to_string());

        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| PosError::transaction_failed(PosError::Store(e)))?;

        for item in &draft.items {
            decrement_product(&tx, &self.session_id, &item.ean, item.quantity)
                .map_err(PosError::transaction_failed)?;
        }

        tx.execute(
            "INSERT INTO transactions (
                id, session_id, created_at, receipt_no, total_amount, original_total,
                payment_methods, items, customer_phoneno, loyalty_points,
                credit_note_points, discount, status, synced
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'false')",
            params![
                transaction_id,
                self.session_id,
                now,
                receipt_no,
                draft.total_amount,
                draft.original_total,
                payments_json,
                items_json,
                draft.customer_phoneno,
                redemption.loyalty_points,
                redemption.credit_note_points,
                draft.discount,
                status,
            ],
        )
        .map_err(|e| PosError::transaction_failed(PosError::Store(e)))?;

        tx.commit()
            .map_err(|e| PosError::transaction_failed(PosError::Store(e)))?;

        info!(
            transaction_id = %transaction_id,
            receipt_no = %receipt_no,
            items = draft.items.len(),
            "Transaction created, pending sync"
        );

        Ok(transaction_id)
    }

    /// Upsert the customer's balances for a redemption: existing customers
    /// get the ledger's post-redemption balances, a customer created on
    /// first reference starts at the ledger's new balances (zero unless the
    /// ledger says otherwise).
    fn apply_redemption(
        &self,
        conn: &Connection,
        phoneno: &str,
        draft: &TransactionDraft,
        redemption: &PointsLedger,
    ) -> Result<(), PosError> {
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM customers WHERE session_id = ?1 AND phoneno = ?2",
                params![self.session_id, phoneno],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(customer_id) => {
                conn.execute(
                    "UPDATE customers
                     SET loyalty_points = ?3, credit_note_balance = ?4
                     WHERE session_id = ?1 AND id = ?2",
                    params![
                        self.session_id,
                        customer_id,
                        redemption.new_loyalty_points,
                        redemption.new_credit_note_points,
                    ],
                )?;
            }
            None => {
                let firstname = draft.customer_firstname.clone().unwrap_or_default();
                conn.execute(
                    "INSERT INTO customers (id, session_id, firstname, phoneno,
                                            loyalty_points, credit_note_balance)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        Uuid::new_v4().to_string(),
                        self.session_id,
                        firstname,
                        phoneno,
                        redemption.new_loyalty_points,
                        redemption.new_credit_note_points,
                    ],
                )?;
            }
        }
        Ok(())
    }

    /// All transactions in this session with `synced='false'`, oldest first.
    pub fn unsynced_transactions(&self) -> Result<Vec<Transaction>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, receipt_no, total_amount, original_total,
                    payment_methods, items, customer_phoneno, loyalty_points,
                    credit_note_points, discount, status, synced, session_id
             FROM transactions
             WHERE session_id = ?1 AND synced = 'false'
             ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![self.session_id], map_transaction)?;
        collect_rows(rows, "transaction")
    }

    pub fn all_transactions(&self) -> Result<Vec<Transaction>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, created_at, receipt_no, total_amount, original_total,
                    payment_methods, items, customer_phoneno, loyalty_points,
                    credit_note_points, discount, status, synced, session_id
             FROM transactions WHERE session_id = ?1 ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map(params![self.session_id], map_transaction)?;
        collect_rows(rows, "transaction")
    }

    pub fn transaction_by_id(&self, id: &str) -> Result<Option<Transaction>, PosError> {
        let conn = self.db.lock()?;
        let tx = conn
            .query_row(
                "SELECT id, created_at, receipt_no, total_amount, original_total,
                        payment_methods, items, customer_phoneno, loyalty_points,
                        credit_note_points, discount, status, synced, session_id
                 FROM transactions WHERE session_id = ?1 AND id = ?2",
                params![self.session_id, id],
                map_transaction,
            )
            .optional()?;
        Ok(tx)
    }

    /// Flip one transaction to `synced='true'`. Idempotent: marking an
    /// already-synced (or unknown) id is a logged no-op.
    pub fn mark_transaction_synced(&self, id: &str) -> Result<(), PosError> {
        let conn = self.db.lock()?;
        let changed = conn.execute(
            "UPDATE transactions SET synced = 'true'
             WHERE session_id = ?1 AND id = ?2 AND synced = 'false'",
            params![self.session_id, id],
        )?;
        if changed == 0 {
            warn!(transaction_id = %id, "mark_transaction_synced: nothing to flip");
        }
        Ok(())
    }

    /// Move a backend-rejected transaction into the failed-sync quarantine,
    /// keeping its full payload and the rejection message. The row leaves
    /// `transactions` so it can never be re-pushed; review is manual.
    pub fn quarantine_failed_transaction(
        &self,
        tx: &Transaction,
        error_message: &str,
    ) -> Result<(), PosError> {
        let mut conn = self.db.lock()?;
        let payload =
            serde_json::to_string(tx).unwrap_or_else(|_| "{}".to_string());
        let unit = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        unit.execute(
            "INSERT OR REPLACE INTO failed_sync_transactions
                (id, session_id, payload, error_message, failed_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                tx.id,
                self.session_id,
                payload,
                error_message,
                Utc::now().to_rfc3339()
            ],
        )?;
        unit.execute(
            "DELETE FROM transactions WHERE session_id = ?1 AND id = ?2",
            params![self.session_id, tx.id],
        )?;
        unit.commit()?;
        warn!(
            transaction_id = %tx.id,
            error = %error_message,
            "Transaction quarantined after backend rejection"
        );
        Ok(())
    }

    pub fn failed_sync_records(&self) -> Result<Vec<FailedSyncTransaction>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, payload, error_message, failed_at
             FROM failed_sync_transactions WHERE session_id = ?1 ORDER BY failed_at DESC",
        )?;
        let rows = stmt.query_map(params![self.session_id], |row| {
            let payload_str: String = row.get(2)?;
            Ok(FailedSyncTransaction {
                id: row.get(0)?,
                session_id: row.get(1)?,
                payload: serde_json::from_str(&payload_str)
                    .unwrap_or(serde_json::Value::Null),
                error_message: row.get(3)?,
                failed_at: row.get(4)?,
            })
        })?;
        collect_rows(rows, "failed-sync record")
    }

    // -----------------------------------------------------------------------
    // Reference data
    // -----------------------------------------------------------------------

    pub fn payment_methods(&self) -> Result<Vec<PaymentMethod>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, is_active FROM payment_methods
             WHERE session_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![self.session_id], |row| {
            Ok(PaymentMethod {
                id: row.get(0)?,
                name: row.get(1)?,
                is_active: row.get::<_, i64>(2)? != 0,
            })
        })?;
        collect_rows(rows, "payment method")
    }

    pub fn branches(&self) -> Result<Vec<Branch>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, address FROM branches WHERE session_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![self.session_id], |row| {
            Ok(Branch {
                id: row.get(0)?,
                name: row.get(1)?,
                address: row.get(2)?,
            })
        })?;
        collect_rows(rows, "branch")
    }

    pub fn discounts(&self) -> Result<Vec<Discount>, PosError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, code, value, value_type, scope, start_date, end_date, is_active
             FROM discounts WHERE session_id = ?1 ORDER BY code",
        )?;
        let rows = stmt.query_map(params![self.session_id], map_discount)?;
        collect_rows(rows, "discount")
    }

    /// Replace this session's reference data from a remote pull.
    pub fn replace_payment_methods(&self, methods: &[PaymentMethod]) -> Result<(), PosError> {
        let mut conn = self.db.lock()?;
        let unit = conn.transaction()?;
        unit.execute(
            "DELETE FROM payment_methods WHERE session_id = ?1",
            params![self.session_id],
        )?;
        for m in methods {
            unit.execute(
                "INSERT INTO payment_methods (id, session_id, name, is_active)
                 VALUES (?1, ?2, ?3, ?4)",
                params![m.id, self.session_id, m.name, m.is_active as i64],
            )?;
        }
        unit.commit()?;
        Ok(())
    }

    pub fn replace_branches(&self, branches: &[Branch]) -> Result<(), PosError> {
        let mut conn = self.db.lock()?;
        let unit = conn.transaction()?;
        unit.execute(
            "DELETE FROM branches WHERE session_id = ?1",
            params![self.session_id],
        )?;
        for b in branches {
            unit.execute(
                "INSERT INTO branches (id, session_id, name, address)
                 VALUES (?1, ?2, ?3, ?4)",
                params![b.id, self.session_id, b.name, b.address],
            )?;
        }
        unit.commit()?;
        Ok(())
    }

    pub fn replace_discounts(&self, discounts: &[Discount]) -> Result<(), PosError> {
        let mut conn = self.db.lock()?;
        let unit = conn.transaction()?;
        unit.execute(
            "DELETE FROM discounts WHERE session_id = ?1",
            params![self.session_id],
        )?;
        for d in discounts {
            let value_type = serde_plain_name(&d.value_type);
            let scope = match d.scope {
                crate::models::DiscountScope::PerProduct => "discountPerProduct",
                crate::models::DiscountScope::OnTotal => "discountOnTotal",
            };
            unit.execute(
                "INSERT INTO discounts (id, session_id, code, value, value_type, scope,
                                        start_date, end_date, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    d.id,
                    self.session_id,
                    d.code,
                    d.value,
                    value_type,
                    scope,
                    d.start_date.to_rfc3339(),
                    d.end_date.to_rfc3339(),
                    d.is_active as i64,
                ],
            )?;
        }
        unit.commit()?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Bulk deletes and snapshots
    // -----------------------------------------------------------------------

    /// Delete every transaction row for this session.
    pub fn delete_all_transactions(&self) -> Result<(), PosError> {
        let conn = self.db.lock()?;
        let deleted = conn.execute(
            "DELETE FROM transactions WHERE session_id = ?1",
            params![self.session_id],
        )?;
        info!(deleted, "Deleted all transactions for session");
        Ok(())
    }

    /// Remove every row this session owns across all entity tables.
    ///
    /// Used on logout. Each entity group is deleted in its own statement;
    /// a failure in one group is logged and does not block the rest —
    /// logout must not be blocked by cleanup.
    pub fn clear_session_data(&self) -> Result<(), PosError> {
        let conn = self.db.lock()?;
        for table in [
            "transactions",
            "failed_sync_transactions",
            "products",
            "customers",
            "payment_methods",
            "discounts",
            "branches",
        ] {
            let result = conn.execute(
                &format!("DELETE FROM {table} WHERE session_id = ?1"),
                params![self.session_id],
            );
            match result {
                Ok(n) => info!(table, deleted = n, "Cleared session rows"),
                Err(e) => warn!(table, error = %e, "Failed to clear session rows, continuing"),
            }
        }
        Ok(())
    }

    /// Reload every local collection for display (`triggerLocalFetch`).
    pub fn snapshot(&self) -> Result<LocalSnapshot, PosError> {
        Ok(LocalSnapshot {
            products: self.all_products()?,
            customers: self.all_customers()?,
            transactions: self.all_transactions()?,
            payment_methods: self.payment_methods()?,
            discounts: self.discounts()?,
            branches: self.branches()?,
            failed_sync_transactions: self.failed_sync_records()?,
        })
    }

    /// Latest product `last_sync_at` in this session, used as the sync
    /// watermark; `None` when nothing has ever been pulled.
    pub fn latest_product_sync_at(&self) -> Result<Option<String>, PosError> {
        let conn = self.db.lock()?;
        let latest: Option<String> = conn.query_row(
            "SELECT MAX(last_sync_at) FROM products WHERE session_id = ?1",
            params![self.session_id],
            |row| row.get(0),
        )?;
        Ok(latest)
    }
}

// ---------------------------------------------------------------------------
// Shared SQL helpers (usable inside an open transaction)
// ---------------------------------------------------------------------------

/// Conditional decrement: only succeeds when enough stock remains, so the
/// check and the write are one statement and cannot interleave.
fn decrement_product(
    conn: &Connection,
    session_id: &str,
    ean: &str,
    delta: i64,
) -> Result<(), PosError> {
    let changed = conn.execute(
        "UPDATE products
         SET available_quantity = available_quantity - ?3, is_modified = 1
         WHERE session_id = ?1 AND ean = ?2 AND available_quantity >= ?3",
        params![session_id, ean, delta],
    )?;
    if changed == 1 {
        return Ok(());
    }

    let available: Option<i64> = conn
        .query_row(
            "SELECT available_quantity FROM products WHERE session_id = ?1 AND ean = ?2",
            params![session_id, ean],
            |row| row.get(0),
        )
        .optional()?;

    match available {
        None => Err(PosError::ProductNotFound { ean: ean.to_string() }),
        Some(available) => Err(PosError::InsufficientStock {
            ean: ean.to_string(),
            available,
            requested: delta,
        }),
    }
}

fn upsert_product_from_remote(
    conn: &Connection,
    session_id: &str,
    product: &Product,
) -> Result<(), PosError> {
    conn.execute(
        "INSERT INTO products (id, session_id, product_code, ean, product_name,
                               brand_name, brand_id, retail_price, available_quantity,
                               size, color, last_sync_at, is_modified)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, 0)
         ON CONFLICT(session_id, ean) DO UPDATE SET
            id = excluded.id,
            product_code = excluded.product_code,
            product_name = excluded.product_name,
            brand_name = excluded.brand_name,
            brand_id = excluded.brand_id,
            retail_price = excluded.retail_price,
            available_quantity = excluded.available_quantity,
            size = excluded.size,
            color = excluded.color,
            last_sync_at = excluded.last_sync_at,
            is_modified = 0",
        params![
            product.id,
            session_id,
            product.product_code,
            product.ean,
            product.product_name,
            product.brand_name,
            product.brand_id,
            product.retail_price,
            product.available_quantity,
            product.size,
            product.color,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn upsert_customer(
    conn: &Connection,
    session_id: &str,
    customer: &Customer,
) -> Result<(), PosError> {
    conn.execute(
        "INSERT INTO customers (id, session_id, firstname, lastname, email, phoneno,
                                gender, age, country, state, city, address,
                                loyalty_points, credit_note_balance)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
         ON CONFLICT(session_id, phoneno) DO UPDATE SET
            id = excluded.id,
            firstname = excluded.firstname,
            lastname = excluded.lastname,
            email = excluded.email,
            gender = excluded.gender,
            age = excluded.age,
            country = excluded.country,
            state = excluded.state,
            city = excluded.city,
            address = excluded.address,
            loyalty_points = excluded.loyalty_points,
            credit_note_balance = excluded.credit_note_balance",
        params![
            customer.id,
            session_id,
            customer.firstname,
            customer.lastname,
            customer.email,
            customer.phoneno,
            customer.gender,
            customer.age,
            customer.country,
            customer.state,
            customer.city,
            customer.address,
            customer.loyalty_points,
            customer.credit_note_balance,
        ],
    )?;
    Ok(())
}

/// Generate a sequential receipt number in format RCP-DDMMYYYY-NNNNN.
///
/// Uses `local_settings` (category='transactions', key='receipt_counter') as
/// a persistent counter.
fn next_receipt_number(conn: &Connection) -> String {
    let date_display = chrono::Local::now().format("%d%m%Y").to_string();

    let current: i64 = conn
        .query_row(
            "SELECT setting_value FROM local_settings \
             WHERE setting_category = ?1 AND setting_key = ?2",
            params![RECEIPT_CATEGORY, RECEIPT_COUNTER_KEY],
            |row| {
                row.get::<_, String>(0)
                    .map(|v| v.parse::<i64>().unwrap_or(0))
            },
        )
        .unwrap_or(0);

    let next = current + 1;
    let _ = db::set_setting(conn, RECEIPT_CATEGORY, RECEIPT_COUNTER_KEY, &next.to_string());

    format!("RCP-{}-{:05}", date_display, next)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn map_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        product_code: row.get(1)?,
        ean: row.get(2)?,
        product_name: row.get(3)?,
        brand_name: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
        brand_id: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        retail_price: row.get(6)?,
        available_quantity: row.get(7)?,
        size: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        color: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        last_sync_at: row.get(10)?,
        is_modified: row.get::<_, i64>(11)? != 0,
    })
}

fn map_customer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Customer> {
    Ok(Customer {
        id: row.get(0)?,
        firstname: row.get(1)?,
        lastname: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        email: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
        phoneno: row.get(4)?,
        gender: row.get::<_, Option<String>>(5)?.unwrap_or_default(),
        age: row.get(6)?,
        country: row.get::<_, Option<String>>(7)?.unwrap_or_default(),
        state: row.get::<_, Option<String>>(8)?.unwrap_or_default(),
        city: row.get::<_, Option<String>>(9)?.unwrap_or_default(),
        address: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        loyalty_points: row.get(11)?,
        credit_note_balance: row.get(12)?,
    })
}

fn map_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<Transaction> {
    let payments_str: String = row.get(5)?;
    let items_str: String = row.get(6)?;
    Ok(Transaction {
        id: row.get(0)?,
        created_at: row.get(1)?,
        receipt_no: row.get(2)?,
        total_amount: row.get(3)?,
        original_total: row.get(4)?,
        payment_methods: serde_json::from_str(&payments_str).unwrap_or_default(),
        items: serde_json::from_str(&items_str).unwrap_or_default(),
        customer_phoneno: row.get(7)?,
        loyalty_points: row.get(8)?,
        credit_note_points: row.get(9)?,
        discount: row.get(10)?,
        status: row.get(11)?,
        synced: row.get(12)?,
        session_id: row.get(13)?,
    })
}

fn map_discount(row: &rusqlite::Row<'_>) -> rusqlite::Result<Discount> {
    use crate::models::{DiscountScope, DiscountValueType};
    use chrono::DateTime;

    let value_type: String = row.get(3)?;
    let scope: String = row.get(4)?;
    let start: String = row.get(5)?;
    let end: String = row.get(6)?;
    Ok(Discount {
        id: row.get(0)?,
        code: row.get(1)?,
        value: row.get(2)?,
        value_type: if value_type == "fixed" {
            DiscountValueType::Fixed
        } else {
            DiscountValueType::Percentage
        },
        scope: if scope == "discountPerProduct" {
            DiscountScope::PerProduct
        } else {
            DiscountScope::OnTotal
        },
        start_date: DateTime::parse_from_rfc3339(&start)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        end_date: DateTime::parse_from_rfc3339(&end)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        is_active: row.get::<_, i64>(7)? != 0,
    })
}

fn serde_plain_name(value_type: &crate::models::DiscountValueType) -> &'static str {
    match value_type {
        crate::models::DiscountValueType::Percentage => "percentage",
        crate::models::DiscountValueType::Fixed => "fixed",
    }
}

/// Collect mapped rows, skipping (and logging) malformed ones rather than
/// failing the whole query.
fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> Result<Vec<T>, PosError> {
    let mut out = Vec::new();
    for row in rows {
        match row {
            Ok(v) => out.push(v),
            Err(e) => warn!("skipping malformed {what} row: {e}"),
        }
    }
    Ok(out)
}

// ===========================================================================
// Tests
// ===========================================================================
