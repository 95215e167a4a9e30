//! Remote backend client.
//!
//! The sync engine talks to the backend through the `RemoteApi` trait so it
//! can run against a fake in tests; `HttpRemoteApi` is the production
//! implementation: authenticated JSON over HTTPS with friendly error
//! mapping for the operator-facing sync status line.

use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::info;

use crate::error::RemoteError;
use crate::models::{Customer, Product, Transaction};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// The remote backend as a capability. The sync engine holds one
/// implementation for its whole lifetime; futures are `Send` so the engine
/// can run inside a spawned background task.
pub trait RemoteApi: Send + Sync {
    /// Full product catalog for this store. `since` is the caller's
    /// watermark; backends that support deltas may use it, the reference
    /// backend ignores it and returns everything.
    fn fetch_store_products(
        &self,
        since: &str,
    ) -> impl Future<Output = Result<Vec<Product>, RemoteError>> + Send;

    /// Full customer list for this store.
    fn fetch_customers(&self) -> impl Future<Output = Result<Vec<Customer>, RemoteError>> + Send;

    /// Push a batch of locally created transactions. Fails on any rejection;
    /// `RemoteError::Rejected` identifies a single bad transaction so the
    /// caller can quarantine it.
    fn sync_transactions(
        &self,
        transactions: &[Transaction],
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend base URL:
/// - strip trailing slashes
/// - strip a trailing `/api` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    // Ensure scheme
    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    // Strip trailing slashes
    while url.ends_with('/') {
        url.pop();
    }

    // Strip trailing /api
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }

    while url.ends_with('/') {
        url.pop();
    }

    url
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into the remote taxonomy.
fn friendly_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Unreachable(url.to_string());
    }
    if err.is_timeout() {
        return RemoteError::Timeout(url.to_string());
    }
    RemoteError::Status(format!("network error communicating with {url}: {err}"))
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "login token is invalid or expired".to_string(),
        403 => "store not authorized".to_string(),
        404 => "backend endpoint not found".to_string(),
        s if s >= 500 => format!("backend server error (HTTP {s})"),
        s => format!("unexpected response from backend (HTTP {s})"),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

/// reqwest-backed `RemoteApi` against the store's backend.
pub struct HttpRemoteApi {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpRemoteApi {
    pub fn new(base_url: &str, token: &str) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| RemoteError::Status(format!("failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            token: token.to_string(),
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value, RemoteError> {
        let url = format!("{}{path}", self.base_url);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RemoteError::Status(format!(
                "{} (HTTP {})",
                status_error(status),
                status.as_u16()
            )));
        }
        if body.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body).map_err(|e| RemoteError::BadResponse(e.to_string()))
    }
}

impl RemoteApi for HttpRemoteApi {
    async fn fetch_store_products(&self, since: &str) -> Result<Vec<Product>, RemoteError> {
        let body = self
            .get_json(&format!("/api/pos/products?since={since}"))
            .await?;
        let list = body
            .get("products")
            .cloned()
            .unwrap_or(body);
        serde_json::from_value(list).map_err(|e| RemoteError::BadResponse(e.to_string()))
    }

    async fn fetch_customers(&self) -> Result<Vec<Customer>, RemoteError> {
        let body = self.get_json("/api/pos/customers").await?;
        let list = body.get("customers").cloned().unwrap_or(body);
        serde_json::from_value(list).map_err(|e| RemoteError::BadResponse(e.to_string()))
    }

    async fn sync_transactions(&self, transactions: &[Transaction]) -> Result<(), RemoteError> {
        let url = format!("{}/api/pos/transactions/sync", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "transactions": transactions }))
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        let status = resp.status();
        if status.is_success() {
            info!(count = transactions.len(), "Pushed transaction batch");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        // 422 with a transactionId identifies one rejected transaction the
        // caller should quarantine; anything else fails the whole batch.
        if status == StatusCode::UNPROCESSABLE_ENTITY {
            if let Ok(json) = serde_json::from_str::<Value>(&body) {
                let id = json
                    .get("transactionId")
                    .or_else(|| json.get("transaction_id"))
                    .and_then(Value::as_str);
                if let Some(id) = id {
                    let message = json
                        .get("error")
                        .or_else(|| json.get("message"))
                        .and_then(Value::as_str)
                        .unwrap_or("rejected by backend")
                        .to_string();
                    return Err(RemoteError::Rejected {
                        transaction_id: id.to_string(),
                        message,
                    });
                }
            }
        }

        let detail = if body.trim().is_empty() {
            format!("{} (HTTP {})", status_error(status), status.as_u16())
        } else {
            format!(
                "{} (HTTP {}): {}",
                status_error(status),
                status.as_u16(),
                body.trim()
            )
        };
        Err(RemoteError::Status(detail))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
