//! Local SQLite store for the offline sales core.
//!
//! Uses rusqlite with WAL mode so reads and writes stay instant while the
//! network is down. Provides schema migrations, settings helpers, and the
//! shared connection state the session-scoped facades operate through.
//! Every data table carries a `session_id` column; queries in `data.rs`
//! always filter on it.

use rusqlite::{params, Connection};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::PosError;

/// Shared state holding the database connection.
///
/// The mutex serializes all store access within the process; together with
/// the conditional-update SQL in `data.rs` this is what makes two concurrent
/// sales of the last unit of a product resolve to exactly one winner.
pub struct DbState {
    pub(crate) conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    /// Lock the connection, translating a poisoned mutex into `PosError`.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, PosError> {
        self.conn.lock().map_err(|_| PosError::StorePoisoned)
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 3;

/// Initialize the database at `{data_dir}/pos-offline.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On corruption or open failure,
/// deletes the file and retries once.
pub fn init(data_dir: &Path) -> Result<DbState, PosError> {
    fs::create_dir_all(data_dir).map_err(io_to_store)?;

    let db_path = data_dir.join("pos-offline.db");
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                // Also remove WAL/SHM files if present
                let wal = db_path.with_extension("db-wal");
                let shm = db_path.with_extension("db-shm");
                let _ = fs::remove_file(&wal);
                let _ = fs::remove_file(&shm);
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open an in-memory store with the full schema applied, for embedding
/// hosts that want a throwaway partition (and for tests).
pub fn init_in_memory() -> Result<DbState, PosError> {
    let conn = Connection::open_in_memory()?;
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    run_migrations(&conn)?;
    Ok(DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    })
}

fn io_to_store(e: io::Error) -> PosError {
    PosError::Store(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_CANTOPEN),
        Some(format!("data dir: {e}")),
    ))
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection, PosError> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<(), PosError> {
    // Ensure schema_version table exists first
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }
    if current < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Migration v1: catalog, customers, reference data, and local settings.
fn migrate_v1(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- products (session-partitioned catalog)
        CREATE TABLE IF NOT EXISTS products (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            product_code TEXT NOT NULL,
            ean TEXT NOT NULL,
            product_name TEXT NOT NULL,
            brand_name TEXT DEFAULT '',
            brand_id TEXT DEFAULT '',
            retail_price REAL NOT NULL DEFAULT 0,
            available_quantity INTEGER NOT NULL DEFAULT 0
                CHECK (available_quantity >= 0),
            size TEXT DEFAULT '',
            color TEXT DEFAULT '',
            last_sync_at TEXT,
            is_modified INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (session_id, id)
        );

        -- customers (phone number is the natural key within a session)
        CREATE TABLE IF NOT EXISTS customers (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            firstname TEXT NOT NULL DEFAULT '',
            lastname TEXT DEFAULT '',
            email TEXT DEFAULT '',
            phoneno TEXT NOT NULL,
            gender TEXT DEFAULT '',
            age INTEGER,
            country TEXT DEFAULT '',
            state TEXT DEFAULT '',
            city TEXT DEFAULT '',
            address TEXT DEFAULT '',
            loyalty_points REAL NOT NULL DEFAULT 0,
            credit_note_balance REAL NOT NULL DEFAULT 0,
            PRIMARY KEY (session_id, id)
        );

        -- payment_methods / branches / discounts (remote reference data)
        CREATE TABLE IF NOT EXISTS payment_methods (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (session_id, id)
        );

        CREATE TABLE IF NOT EXISTS branches (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            name TEXT NOT NULL,
            address TEXT DEFAULT '',
            PRIMARY KEY (session_id, id)
        );

        CREATE TABLE IF NOT EXISTS discounts (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            code TEXT NOT NULL,
            value REAL NOT NULL DEFAULT 0,
            value_type TEXT NOT NULL DEFAULT 'percentage'
                CHECK (value_type IN ('percentage', 'fixed')),
            scope TEXT NOT NULL DEFAULT 'discountOnTotal'
                CHECK (scope IN ('discountPerProduct', 'discountOnTotal')),
            start_date TEXT NOT NULL,
            end_date TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY (session_id, id)
        );

        -- Record migration
        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        PosError::Store(e)
    })?;

    info!("Applied migration v1 (catalog, customers, reference data)");
    Ok(())
}

/// Migration v2: transactions and the failed-sync quarantine table.
fn migrate_v2(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        -- transactions (immutable after insert except the synced flag)
        CREATE TABLE IF NOT EXISTS transactions (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            created_at TEXT NOT NULL,
            receipt_no TEXT NOT NULL,
            total_amount REAL NOT NULL DEFAULT 0,
            original_total REAL NOT NULL DEFAULT 0,
            payment_methods TEXT NOT NULL DEFAULT '[]',
            items TEXT NOT NULL DEFAULT '[]',
            customer_phoneno TEXT,
            loyalty_points REAL NOT NULL DEFAULT 0,
            credit_note_points REAL NOT NULL DEFAULT 0,
            discount REAL NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'completed',
            synced TEXT NOT NULL DEFAULT 'false'
                CHECK (synced IN ('true', 'false')),
            PRIMARY KEY (session_id, id)
        );

        -- failed_sync_transactions (backend-rejected pushes, manual review)
        CREATE TABLE IF NOT EXISTS failed_sync_transactions (
            id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            error_message TEXT NOT NULL DEFAULT '',
            failed_at TEXT NOT NULL,
            PRIMARY KEY (session_id, id)
        );

        -- Record migration
        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        PosError::Store(e)
    })?;

    info!("Applied migration v2 (transactions + failed-sync quarantine)");
    Ok(())
}

/// Migration v3: secondary indexes and natural-key uniqueness for the
/// lookups the checkout path performs (by ean, product code, phone number,
/// synced flag).
fn migrate_v3(conn: &Connection) -> Result<(), PosError> {
    conn.execute_batch(
        "
        CREATE UNIQUE INDEX IF NOT EXISTS idx_products_session_ean
            ON products(session_id, ean);
        CREATE INDEX IF NOT EXISTS idx_products_session_code
            ON products(session_id, product_code);

        CREATE UNIQUE INDEX IF NOT EXISTS idx_customers_session_phone
            ON customers(session_id, phoneno);

        CREATE INDEX IF NOT EXISTS idx_transactions_session_synced
            ON transactions(session_id, synced);
        CREATE INDEX IF NOT EXISTS idx_transactions_created_at
            ON transactions(created_at);

        CREATE INDEX IF NOT EXISTS idx_discounts_session_code
            ON discounts(session_id, code);

        -- Record migration
        INSERT INTO schema_version (version) VALUES (3);
        ",
    )
    .map_err(|e| {
        error!("Migration v3 failed: {e}");
        PosError::Store(e)
    })?;

    info!("Applied migration v3 (secondary indexes)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(
    conn: &Connection,
    category: &str,
    key: &str,
    value: &str,
) -> Result<(), PosError> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// Delete a single setting.
pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<(), PosError> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use serial_test::serial;

    /// Open an in-memory database and apply pragmas (mirrors open_and_configure).
    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
        .expect("pragma setup");
        conn
    }

    /// Helper: list table names in the database.
    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("run_migrations should succeed");

        let tables = table_names(&conn);
        for expected in [
            "local_settings",
            "products",
            "customers",
            "payment_methods",
            "branches",
            "discounts",
            "transactions",
            "failed_sync_transactions",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .expect("read schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_quantity_check_constraint_rejects_negative() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let result = conn.execute(
            "INSERT INTO products (id, session_id, product_code, ean, product_name, retail_price, available_quantity)
             VALUES ('p1', 's1', 'SKU-1', '123', 'Shirt', 10.0, -1)",
            [],
        );
        assert!(result.is_err(), "negative quantity should be rejected");
    }

    #[test]
    fn test_ean_unique_per_session_not_globally() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO products (id, session_id, product_code, ean, product_name, retail_price, available_quantity)
             VALUES ('p1', 's1', 'SKU-1', '123', 'Shirt', 10.0, 1)",
            [],
        )
        .expect("first insert");

        // Same ean in a different session is fine
        conn.execute(
            "INSERT INTO products (id, session_id, product_code, ean, product_name, retail_price, available_quantity)
             VALUES ('p1', 's2', 'SKU-1', '123', 'Shirt', 10.0, 1)",
            [],
        )
        .expect("same ean, other session");

        // Duplicate ean in the same session is rejected
        let dup = conn.execute(
            "INSERT INTO products (id, session_id, product_code, ean, product_name, retail_price, available_quantity)
             VALUES ('p2', 's1', 'SKU-2', '123', 'Other', 5.0, 1)",
            [],
        );
        assert!(
            dup.is_err(),
            "duplicate ean within session should be rejected"
        );
    }

    #[test]
    fn test_synced_flag_check_constraint() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let bad = conn.execute(
            "INSERT INTO transactions (id, session_id, created_at, receipt_no, synced)
             VALUES ('t1', 's1', datetime('now'), 'RCP-1', 'maybe')",
            [],
        );
        assert!(bad.is_err(), "synced must be 'true' or 'false'");
    }

    #[test]
    fn test_settings_roundtrip_and_delete() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "session", "session_id", "s-abc").expect("set");
        assert_eq!(
            get_setting(&conn, "session", "session_id").as_deref(),
            Some("s-abc")
        );

        set_setting(&conn, "session", "session_id", "s-def").expect("overwrite");
        assert_eq!(
            get_setting(&conn, "session", "session_id").as_deref(),
            Some("s-def")
        );

        delete_setting(&conn, "session", "session_id").expect("delete");
        assert!(get_setting(&conn, "session", "session_id").is_none());
    }

    #[test]
    #[serial]
    fn test_wal_mode_on_file_db() {
        // WAL only works on file-backed databases; in-memory always returns
        // "memory". Use a tempfile to verify the full open_and_configure path.
        let dir = std::env::temp_dir().join("pos_offline_test_wal");
        let _ = std::fs::create_dir_all(&dir);
        let db_path = dir.join("test_wal.db");
        let _ = std::fs::remove_file(&db_path);

        let conn = open_and_configure(&db_path).expect("open temp db");
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .expect("read journal_mode");
        assert_eq!(mode.to_lowercase(), "wal", "journal_mode should be WAL");

        drop(conn);
        let _ = std::fs::remove_file(&db_path);
        let _ = std::fs::remove_file(db_path.with_extension("db-wal"));
        let _ = std::fs::remove_file(db_path.with_extension("db-shm"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
