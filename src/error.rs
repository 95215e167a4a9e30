//! Error taxonomy for the offline sales core.
//!
//! Every operation boundary (decrement, checkout, sync) translates its
//! underlying failure into one of these variants; nothing is silently
//! swallowed. Sync failures are recoverable — the affected transactions stay
//! unsynced and are retried on the next cycle.

use thiserror::Error;

/// Errors surfaced by the remote backend client.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The backend rejected one specific transaction in a pushed batch.
    /// The caller quarantines it for manual review; it is never retried.
    #[error("transaction {transaction_id} rejected by backend: {message}")]
    Rejected {
        transaction_id: String,
        message: String,
    },

    #[error("cannot reach backend at {0}")]
    Unreachable(String),

    #[error("connection to {0} timed out")]
    Timeout(String),

    #[error("{0}")]
    Status(String),

    #[error("invalid JSON from backend: {0}")]
    BadResponse(String),
}

/// Top-level error type for the sales core.
#[derive(Debug, Error)]
pub enum PosError {
    /// Session id cannot be derived; the caller must force re-authentication.
    #[error("missing session context: {0}")]
    MissingContext(&'static str),

    /// A decrement referenced an ean with no product row in this session.
    #[error("no product with ean {ean} in this session")]
    ProductNotFound { ean: String },

    /// A decrement would drive `available_quantity` negative. The enclosing
    /// checkout unit aborts with no partial write.
    #[error("insufficient quantity for ean {ean}: have {available}, need {requested}")]
    InsufficientStock {
        ean: String,
        available: i64,
        requested: i64,
    },

    /// Any failure inside `create_transaction`'s atomic unit. No product
    /// decrement or transaction row from this call survives.
    #[error("transaction creation failed: {0}")]
    TransactionFailed(#[source] Box<PosError>),

    /// A sync cycle failed. Affected transactions remain `synced='false'`.
    #[error("sync failed: {0}")]
    Sync(String),

    #[error("remote backend: {0}")]
    Remote(#[from] RemoteError),

    #[error("local store: {0}")]
    Store(#[from] rusqlite::Error),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("local store lock poisoned")]
    StorePoisoned,
}

impl PosError {
    /// Wrap a checkout-unit failure, keeping the cause in the chain.
    pub(crate) fn transaction_failed(cause: PosError) -> Self {
        PosError::TransactionFailed(Box::new(cause))
    }
}
