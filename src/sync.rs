//! Sync engine: reconciles the local partition with the remote backend.
//!
//! `refresh` pulls the remote product and customer catalogs into the local
//! store; `sync` additionally pushes unsynced local transactions and flips
//! their flag on success. One engine exists per process, owned by the
//! composition root; an in-progress flag makes overlapping `sync` calls
//! no-ops, and an RAII guard releases the flag on every exit path.
//!
//! Conflict handling is deliberately blunt: the remote catalog always wins.
//! A product decremented locally while a refresh is in flight gets
//! overwritten by the remote copy — that is the documented policy, not an
//! accident.

use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::data::LocalDataAccess;
use crate::error::{PosError, RemoteError};
use crate::models::Product;
use crate::remote::RemoteApi;

/// Watermark used when no product has ever been pulled.
const SYNC_SINCE_FALLBACK: &str = "1970-01-01T00:00:00.000Z";

/// How local rows are reconciled with remote catalog rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// The remote copy overwrites the local row, including rows whose
    /// `is_modified` flag marks local edits.
    RemoteWins,
}

/// What a `sync` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The cycle ran to completion.
    Completed(SyncReport),
    /// Another sync was already in flight; this call did nothing.
    AlreadyRunning,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub products_pulled: usize,
    pub transactions_pushed: usize,
    pub transactions_marked: usize,
}

/// Releases the in-progress flag when dropped, whatever path exits `sync`.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// The one sync engine for the process.
pub struct SyncEngine<R: RemoteApi> {
    remote: R,
    in_progress: AtomicBool,
    loop_running: AtomicBool,
    last_sync: Mutex<Option<String>>,
    policy: ConflictPolicy,
}

impl<R: RemoteApi> SyncEngine<R> {
    pub fn new(remote: R) -> Self {
        Self {
            remote,
            in_progress: AtomicBool::new(false),
            loop_running: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            policy: ConflictPolicy::RemoteWins,
        }
    }

    /// RFC 3339 timestamp of the last successful cycle, if any.
    pub fn last_sync(&self) -> Option<String> {
        self.last_sync
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Pull the full remote product and customer catalogs into the local
    /// store for this session. Never touches transactions.
    pub async fn refresh(&self, data: &LocalDataAccess) -> Result<(), PosError> {
        let products = self
            .remote
            .fetch_store_products(SYNC_SINCE_FALLBACK)
            .await
            .map_err(|e| PosError::Sync(e.to_string()))?;
        self.apply_remote_products(data, &products)?;

        let customers = self
            .remote
            .fetch_customers()
            .await
            .map_err(|e| PosError::Sync(e.to_string()))?;
        for customer in &customers {
            data.upsert_customer(customer)?;
        }

        info!(
            products = products.len(),
            customers = customers.len(),
            "Refreshed local catalogs from remote"
        );
        Ok(())
    }

    /// One sync cycle: pull remote products, push unsynced transactions,
    /// mark the pushed ones synced.
    ///
    /// A push failure propagates as `Sync` and leaves every transaction
    /// `synced='false'` for the next cycle; a single rejected transaction is
    /// quarantined and the cycle fails so the rest retry. The in-progress
    /// flag is released on every path.
    pub async fn sync(&self, data: &LocalDataAccess) -> Result<SyncOutcome, PosError> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("Sync already in progress, skipping");
            return Ok(SyncOutcome::AlreadyRunning);
        }
        let _guard = InProgressGuard(&self.in_progress);

        let mut report = SyncReport::default();

        // Watermark for backends that serve deltas; the reference backend
        // returns the full set regardless.
        let since = data
            .latest_product_sync_at()?
            .unwrap_or_else(|| SYNC_SINCE_FALLBACK.to_string());
        debug!(since = %since, "Starting sync cycle");

        let products = self
            .remote
            .fetch_store_products(&since)
            .await
            .map_err(|e| PosError::Sync(e.to_string()))?;
        report.products_pulled = products.len();
        self.apply_remote_products(data, &products)?;

        let unsynced = data.unsynced_transactions()?;
        if unsynced.is_empty() {
            debug!("No unsynced transactions, skipping push");
        } else {
            match self.remote.sync_transactions(&unsynced).await {
                Ok(()) => {
                    report.transactions_pushed = unsynced.len();
                    // Each flag flip is independent: one failure must not
                    // block marking the others.
                    for tx in &unsynced {
                        match data.mark_transaction_synced(&tx.id) {
                            Ok(()) => report.transactions_marked += 1,
                            Err(e) => {
                                warn!(transaction_id = %tx.id, error = %e, "Failed to mark synced")
                            }
                        }
                    }
                }
                Err(RemoteError::Rejected {
                    transaction_id,
                    message,
                }) => {
                    if let Some(tx) = unsynced.iter().find(|t| t.id == transaction_id) {
                        data.quarantine_failed_transaction(tx, &message)?;
                    } else {
                        warn!(
                            transaction_id = %transaction_id,
                            "Backend rejected an unknown transaction id"
                        );
                    }
                    return Err(PosError::Sync(format!(
                        "transaction {transaction_id} rejected: {message}"
                    )));
                }
                Err(e) => return Err(PosError::Sync(e.to_string())),
            }
        }

        let now = Utc::now().to_rfc3339();
        if let Ok(mut guard) = self.last_sync.lock() {
            *guard = Some(now);
        }

        info!(
            products_pulled = report.products_pulled,
            transactions_pushed = report.transactions_pushed,
            "Sync cycle completed"
        );
        Ok(SyncOutcome::Completed(report))
    }

    fn apply_remote_products(
        &self,
        data: &LocalDataAccess,
        products: &[Product],
    ) -> Result<(), PosError> {
        match self.policy {
            ConflictPolicy::RemoteWins => {
                for product in products {
                    data.upsert_product_from_remote(product)?;
                }
            }
        }
        Ok(())
    }

    /// Stop a running background loop after its current iteration.
    pub fn stop_loop(&self) {
        self.loop_running.store(false, Ordering::SeqCst);
    }
}

/// Start the background sync loop: one `sync` call per interval until
/// `stop_loop` is called. Failures are logged and the loop keeps going —
/// the next tick is the retry mechanism.
pub fn run_sync_loop<R: RemoteApi + 'static>(
    engine: Arc<SyncEngine<R>>,
    data: Arc<LocalDataAccess>,
    interval: Duration,
) -> JoinHandle<()> {
    engine.loop_running.store(true, Ordering::SeqCst);
    tokio::spawn(async move {
        info!(interval_secs = interval.as_secs(), "Sync loop started");
        loop {
            tokio::time::sleep(interval).await;
            if !engine.loop_running.load(Ordering::SeqCst) {
                info!("Sync loop stopped");
                break;
            }
            match engine.sync(&data).await {
                Ok(SyncOutcome::Completed(report)) => {
                    debug!(
                        pushed = report.transactions_pushed,
                        "Background sync cycle done"
                    );
                }
                Ok(SyncOutcome::AlreadyRunning) => {}
                Err(e) => warn!("Background sync cycle failed: {e}"),
            }
        }
    })
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::LocalDataAccess;
    use crate::db::{init_in_memory, DbState};
    use crate::models::{Customer, PaymentSplit, Transaction, TransactionDraft, TransactionItem};
    use crate::points::PointsLedger;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Notify;

    /// How the fake backend responds to a transaction push.
    enum PushMode {
        Succeed,
        FailNetwork,
        RejectFirst(String),
    }

    struct FakeRemote {
        products: Mutex<Vec<Product>>,
        customers: Mutex<Vec<Customer>>,
        push_mode: PushMode,
        push_calls: AtomicUsize,
        last_since: Mutex<Option<String>>,
        /// When set, `fetch_store_products` parks until notified, letting a
        /// test hold a sync cycle open.
        hold_fetch: Option<Arc<Notify>>,
    }

    impl FakeRemote {
        fn new(push_mode: PushMode) -> Self {
            Self {
                products: Mutex::new(Vec::new()),
                customers: Mutex::new(Vec::new()),
                push_mode,
                push_calls: AtomicUsize::new(0),
                last_since: Mutex::new(None),
                hold_fetch: None,
            }
        }

        fn with_products(self, products: Vec<Product>) -> Self {
            *self.products.lock().unwrap() = products;
            self
        }
    }

    impl RemoteApi for FakeRemote {
        async fn fetch_store_products(&self, since: &str) -> Result<Vec<Product>, RemoteError> {
            *self.last_since.lock().unwrap() = Some(since.to_string());
            if let Some(notify) = &self.hold_fetch {
                notify.notified().await;
            }
            Ok(self.products.lock().unwrap().clone())
        }

        async fn fetch_customers(&self) -> Result<Vec<Customer>, RemoteError> {
            Ok(self.customers.lock().unwrap().clone())
        }

        async fn sync_transactions(
            &self,
            transactions: &[Transaction],
        ) -> Result<(), RemoteError> {
            self.push_calls.fetch_add(1, Ordering::SeqCst);
            match &self.push_mode {
                PushMode::Succeed => Ok(()),
                PushMode::FailNetwork => {
                    Err(RemoteError::Unreachable("https://backend.test".into()))
                }
                PushMode::RejectFirst(message) => Err(RemoteError::Rejected {
                    transaction_id: transactions[0].id.clone(),
                    message: message.clone(),
                }),
            }
        }
    }

    fn store() -> Arc<DbState> {
        Arc::new(init_in_memory().expect("in-memory store"))
    }

    fn product(ean: &str, qty: i64) -> Product {
        Product {
            id: format!("p-{ean}"),
            product_code: format!("SKU-{ean}"),
            ean: ean.to_string(),
            product_name: format!("Product {ean}"),
            brand_name: "".into(),
            brand_id: "".into(),
            retail_price: 10.0,
            available_quantity: qty,
            size: "".into(),
            color: "".into(),
            last_sync_at: None,
            is_modified: false,
        }
    }

    fn sale(d: &LocalDataAccess, ean: &str) -> String {
        let draft = TransactionDraft {
            items: vec![TransactionItem {
                ean: ean.to_string(),
                product_code: format!("SKU-{ean}"),
                product_name: format!("Product {ean}"),
                retail_price: 10.0,
                quantity: 1,
                total_price: 10.0,
                discount: None,
            }],
            payment_methods: vec![PaymentSplit {
                method: "cash".into(),
                amount: 10.0,
            }],
            total_amount: 10.0,
            original_total: 10.0,
            discount: 0.0,
            status: "completed".into(),
            customer_phoneno: None,
            customer_firstname: None,
        };
        d.create_transaction(&draft, &PointsLedger::default()).unwrap()
    }

    #[tokio::test]
    async fn test_sync_pushes_and_marks_all_unsynced() {
        let db = store();
        let data = LocalDataAccess::new(db, "s1".into());
        let engine = SyncEngine::new(
            FakeRemote::new(PushMode::Succeed).with_products(vec![product("111", 9)]),
        );

        data.upsert_product_from_remote(&product("111", 5)).unwrap();
        sale(&data, "111");
        sale(&data, "111");

        let outcome = engine.sync(&data).await.unwrap();
        match outcome {
            SyncOutcome::Completed(report) => {
                assert_eq!(report.transactions_pushed, 2);
                assert_eq!(report.transactions_marked, 2);
                assert_eq!(report.products_pulled, 1);
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        assert!(data.unsynced_transactions().unwrap().is_empty());
        assert!(engine.last_sync().is_some());
        assert!(!engine.is_syncing(), "guard must be released");
    }

    #[tokio::test]
    async fn test_push_failure_leaves_both_unsynced_and_propagates() {
        let db = store();
        let data = LocalDataAccess::new(db, "s1".into());
        let engine = SyncEngine::new(FakeRemote::new(PushMode::FailNetwork));

        data.upsert_product_from_remote(&product("111", 5)).unwrap();
        sale(&data, "111");
        sale(&data, "111");

        let err = engine.sync(&data).await.unwrap_err();
        assert!(matches!(err, PosError::Sync(_)));

        // Both remain unsynced for retry on the next cycle
        assert_eq!(data.unsynced_transactions().unwrap().len(), 2);
        assert!(engine.last_sync().is_none());

        // Guard was released in spite of the error: a new cycle can start
        assert!(!engine.is_syncing());
    }

    #[tokio::test]
    async fn test_concurrent_sync_is_a_no_op() {
        let db = store();
        let data = Arc::new(LocalDataAccess::new(db, "s1".into()));

        let release = Arc::new(Notify::new());
        let mut remote = FakeRemote::new(PushMode::Succeed);
        remote.hold_fetch = Some(release.clone());
        let engine = Arc::new(SyncEngine::new(remote));

        data.upsert_product_from_remote(&product("111", 5)).unwrap();
        sale(&data, "111");

        let first = {
            let engine = engine.clone();
            let data = data.clone();
            tokio::spawn(async move { engine.sync(&data).await })
        };

        // Wait until the first cycle is parked inside the fetch
        while !engine.is_syncing() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let second = engine.sync(&data).await.unwrap();
        assert_eq!(second, SyncOutcome::AlreadyRunning);
        // The overlapping call never reached the backend push
        assert_eq!(
            engine.remote.push_calls.load(Ordering::SeqCst),
            0,
            "second call must not touch the remote"
        );

        release.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, SyncOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn test_remote_wins_overwrites_locally_modified_products() {
        let db = store();
        let data = LocalDataAccess::new(db, "s1".into());
        let engine = SyncEngine::new(
            FakeRemote::new(PushMode::Succeed).with_products(vec![product("111", 20)]),
        );

        data.upsert_product_from_remote(&product("111", 5)).unwrap();
        data.update_product_quantity("111", 2).unwrap(); // local edit, is_modified=1

        engine.refresh(&data).await.unwrap();

        let p = data.product_by_ean("111").unwrap().unwrap();
        assert_eq!(p.available_quantity, 20, "remote copy wins");
        assert!(!p.is_modified, "remote pull clears the modified flag");
        assert!(p.last_sync_at.is_some());
    }

    #[tokio::test]
    async fn test_rejected_transaction_is_quarantined_not_retried() {
        let db = store();
        let data = LocalDataAccess::new(db, "s1".into());
        let engine = SyncEngine::new(FakeRemote::new(PushMode::RejectFirst(
            "duplicate receipt".into(),
        )));

        data.upsert_product_from_remote(&product("111", 5)).unwrap();
        let rejected_id = sale(&data, "111");
        sale(&data, "111");

        let err = engine.sync(&data).await.unwrap_err();
        assert!(err.to_string().contains("duplicate receipt"));

        // The rejected transaction moved to the quarantine table
        let failed = data.failed_sync_records().unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, rejected_id);

        // The other transaction stays unsynced for the next cycle
        let remaining = data.unsynced_transactions().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0].id, rejected_id);
    }

    #[tokio::test]
    async fn test_watermark_uses_epoch_fallback_then_latest_pull() {
        let db = store();
        let data = LocalDataAccess::new(db, "s1".into());
        let engine = SyncEngine::new(
            FakeRemote::new(PushMode::Succeed).with_products(vec![product("111", 5)]),
        );

        engine.sync(&data).await.unwrap();
        assert_eq!(
            engine.remote.last_since.lock().unwrap().as_deref(),
            Some(SYNC_SINCE_FALLBACK)
        );

        engine.sync(&data).await.unwrap();
        let since = engine.remote.last_since.lock().unwrap().clone().unwrap();
        assert_ne!(since, SYNC_SINCE_FALLBACK, "second cycle uses the pull stamp");
    }

    #[tokio::test]
    async fn test_refresh_pulls_customers_without_touching_transactions() {
        let db = store();
        let data = LocalDataAccess::new(db, "s1".into());
        let mut remote = FakeRemote::new(PushMode::FailNetwork);
        remote.customers = Mutex::new(vec![Customer {
            id: "c1".into(),
            firstname: "Bisi".into(),
            lastname: "".into(),
            email: "".into(),
            phoneno: "0700000001".into(),
            gender: "".into(),
            age: None,
            country: "".into(),
            state: "".into(),
            city: "".into(),
            address: "".into(),
            loyalty_points: 12.0,
            credit_note_balance: 0.0,
        }]);
        let engine = SyncEngine::new(remote);

        data.upsert_product_from_remote(&product("111", 5)).unwrap();
        sale(&data, "111");

        // refresh succeeds even though pushes would fail: it never pushes
        engine.refresh(&data).await.unwrap();

        assert_eq!(data.all_customers().unwrap().len(), 1);
        assert_eq!(data.unsynced_transactions().unwrap().len(), 1);
        assert_eq!(engine.remote.push_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_loop_syncs_until_stopped() {
        let db = store();
        let data = Arc::new(LocalDataAccess::new(db, "s1".into()));
        let engine = Arc::new(SyncEngine::new(
            FakeRemote::new(PushMode::Succeed).with_products(vec![product("111", 5)]),
        ));

        let handle = run_sync_loop(engine.clone(), data.clone(), Duration::from_secs(30));

        // let the spawned loop register its sleep timer before advancing the
        // paused clock, otherwise the first tick lands an interval too late
        tokio::task::yield_now().await;
        tokio::time::advance(Duration::from_secs(31)).await;
        tokio::task::yield_now().await;
        assert!(engine.last_sync().is_some());

        engine.stop_loop();
        tokio::time::advance(Duration::from_secs(31)).await;
        handle.await.unwrap();
    }
}
