//! Offline-first point-of-sale client library.
//!
//! The local SQLite store is the source of truth while the operator works;
//! a background sync engine reconciles it with the remote backend whenever
//! connectivity allows. Every row is partitioned by a session id derived at
//! login, so consecutive logins never see each other's data.
//!
//! Module map:
//! - [`db`] owns the store: open, migrate, settings.
//! - [`session`] derives and caches the session id.
//! - [`data`] is the session-scoped façade: lookups, atomic checkout,
//!   sync bookkeeping, logout cleanup.
//! - [`points`] and [`discount`] are the checkout-side value calculations.
//! - [`remote`] is the backend client behind the [`remote::RemoteApi`] trait.
//! - [`sync`] runs pull/push cycles and the background loop.

use std::path::Path;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod data;
pub mod db;
pub mod discount;
pub mod error;
pub mod models;
pub mod points;
pub mod remote;
pub mod session;
pub mod sync;

pub use data::{LocalDataAccess, LocalSnapshot, StoreRegistry};
pub use db::DbState;
pub use error::{PosError, RemoteError};
pub use points::PointsLedger;
pub use remote::{HttpRemoteApi, RemoteApi};
pub use session::{SessionContext, SessionManager};
pub use sync::{run_sync_loop, ConflictPolicy, SyncEngine, SyncOutcome, SyncReport};

/// Initialize structured logging: console always, plus a daily rolling file
/// when `log_dir` is given. Call once at startup; a second call fails the
/// subscriber install and is ignored.
///
/// `RUST_LOG` overrides the default `info,pos_offline=debug` filter.
pub fn init_tracing(log_dir: Option<&Path>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,pos_offline=debug"));

    let console_layer = fmt::layer().with_target(true);
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer);

    match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).ok();
            let file_appender = tracing_appender::rolling::daily(dir, "pos");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(true);
            if registry.with(file_layer).try_init().is_ok() {
                // Dropping the guard would flush and close the file writer;
                // the process logs until exit, so leak it.
                std::mem::forget(guard);
                info!(log_dir = %dir.display(), "Logging initialized (console + rolling file)");
            }
        }
        None => {
            if registry.try_init().is_ok() {
                info!("Logging initialized (console only)");
            }
        }
    }
}
