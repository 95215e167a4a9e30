//! Session identity for the offline data partition.
//!
//! Every local row belongs to exactly one session: one authenticated
//! operator/store pairing. The id is derived once per login from explicit
//! context (no ambient globals), cached for the manager's lifetime, and
//! persisted in `local_settings` so a restart within the same login resumes
//! the same partition. A repeat login derives a fresh id, so the previous
//! session's unsynced data survives under its own partition until it is
//! explicitly cleared.

use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;

use crate::db::{self, DbState};
use crate::error::PosError;

const SESSION_CATEGORY: &str = "session";
const SESSION_ID_KEY: &str = "session_id";

/// Explicit login context a session id is derived from. Threaded in by the
/// caller rather than read from ambient storage inside each method.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub store_id: String,
    pub firstname: String,
    pub phoneno: String,
    /// Login token proving the context belongs to an authenticated session.
    pub token: String,
}

impl SessionContext {
    fn validate(&self) -> Result<(), PosError> {
        if self.store_id.trim().is_empty() {
            return Err(PosError::MissingContext("store info unavailable"));
        }
        if self.firstname.trim().is_empty() || self.phoneno.trim().is_empty() {
            return Err(PosError::MissingContext("user info unavailable"));
        }
        if self.token.trim().is_empty() {
            return Err(PosError::MissingContext("login token unavailable"));
        }
        Ok(())
    }
}

/// Produces and caches the session identifier for the lifetime of the
/// authenticated session. Owned by the application's composition root.
pub struct SessionManager {
    cached: Mutex<Option<String>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Return the session id, deriving and persisting it on first use.
    ///
    /// Resolution order: in-memory cache, then the persisted value in
    /// `local_settings`, then a fresh derivation from `ctx`. Fails with
    /// `MissingContext` when any context field is empty — the caller must
    /// redirect to login in that case.
    pub fn session_id(&self, ctx: &SessionContext, db: &DbState) -> Result<String, PosError> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = cached.as_ref() {
            return Ok(id.clone());
        }

        let conn = db.lock()?;
        if let Some(id) = db::get_setting(&conn, SESSION_CATEGORY, SESSION_ID_KEY) {
            *cached = Some(id.clone());
            return Ok(id);
        }

        ctx.validate()?;
        let id = derive_session_id(ctx);
        db::set_setting(&conn, SESSION_CATEGORY, SESSION_ID_KEY, &id)?;
        info!(session_id = %id, "Derived new session id");
        *cached = Some(id.clone());
        Ok(id)
    }

    /// Forget the cached and persisted id (logout). The next login derives a
    /// fresh partition; rows under the old id are untouched here.
    pub fn clear(&self, db: &DbState) -> Result<(), PosError> {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = None;
        let conn = db.lock()?;
        db::delete_setting(&conn, SESSION_CATEGORY, SESSION_ID_KEY)?;
        info!("Session id cleared");
        Ok(())
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Deterministic prefix (store + operator identity) plus a random suffix so
/// repeat logins of the same operator land in fresh partitions.
fn derive_session_id(ctx: &SessionContext) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}-{}",
        ctx.store_id.trim(),
        ctx.firstname.trim().to_lowercase(),
        ctx.phoneno.trim(),
        &suffix[..8]
    )
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_in_memory;

    fn ctx() -> SessionContext {
        SessionContext {
            store_id: "store-7".into(),
            firstname: "Amara".into(),
            phoneno: "08031234567".into(),
            token: "tok-1".into(),
        }
    }

    #[test]
    fn test_session_id_is_stable_for_manager_lifetime() {
        let db = init_in_memory().unwrap();
        let mgr = SessionManager::new();
        let first = mgr.session_id(&ctx(), &db).unwrap();
        let second = mgr.session_id(&ctx(), &db).unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("store-7-amara-08031234567-"));
    }

    #[test]
    fn test_session_id_survives_cache_loss_via_settings() {
        let db = init_in_memory().unwrap();
        let first = SessionManager::new().session_id(&ctx(), &db).unwrap();
        // A new manager over the same store (process restart) resumes the id.
        let second = SessionManager::new().session_id(&ctx(), &db).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_repeat_login_after_clear_gets_fresh_partition() {
        let db = init_in_memory().unwrap();
        let mgr = SessionManager::new();
        let first = mgr.session_id(&ctx(), &db).unwrap();
        mgr.clear(&db).unwrap();
        let second = mgr.session_id(&ctx(), &db).unwrap();
        assert_ne!(first, second, "repeat login must land in a new partition");
    }

    #[test]
    fn test_missing_context_fields_are_rejected() {
        let db = init_in_memory().unwrap();
        let mgr = SessionManager::new();

        let mut no_store = ctx();
        no_store.store_id = "".into();
        assert!(matches!(
            mgr.session_id(&no_store, &db),
            Err(PosError::MissingContext(_))
        ));

        let mut no_user = ctx();
        no_user.phoneno = "  ".into();
        assert!(matches!(
            mgr.session_id(&no_user, &db),
            Err(PosError::MissingContext(_))
        ));

        let mut no_token = ctx();
        no_token.token = "".into();
        assert!(matches!(
            mgr.session_id(&no_token, &db),
            Err(PosError::MissingContext(_))
        ));
    }
}
