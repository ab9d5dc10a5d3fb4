//! Parking brake: fail-closed safety gate with optional scopes.
//!
//! Ported from the orchestrator's `safety/parking_brake.py`. One global brake,
//! `engaged` + a set of blocked `scopes` (`global`, `skills`, `sight`, `voice`,
//! `scheduler`, ...). Engaging with no scopes named defaults to `global`, which
//! supersedes every specific scope. State lives in a single `system_flags` row;
//! an audit trail is best-effort and optional so a brake mutation never fails
//! just because nothing is listening for the audit entry.

use crate::error::KernelError;
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};

const FLAG_KEY: &str = "parking_brake";

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BrakeState {
    pub engaged: bool,
    pub scopes: BTreeSet<String>,
}

#[derive(Serialize, Deserialize)]
struct BrakeRow {
    engaged: bool,
    scopes: Vec<String>,
}

/// Sink for brake audit entries. Implemented over the Store's `memories` table
/// in production; a no-op or in-memory fake elsewhere. Failing to record an
/// audit entry must never block the underlying brake mutation.
pub trait AuditSink: Send + Sync {
    fn record(&self, action: &str, scopes: &BTreeSet<String>) -> Result<(), KernelError>;
}

/// Audit sink backed by the store's `memories` table, kind `safety.audit`.
/// Mirrors the original's `kind="safety.audit"` / `key=f"{ts}::{action}"` shape.
pub struct StoreAuditSink {
    store: Arc<Store>,
}

impl StoreAuditSink {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl AuditSink for StoreAuditSink {
    fn record(&self, action: &str, scopes: &BTreeSet<String>) -> Result<(), KernelError> {
        let now = chrono::Utc::now().timestamp();
        let key = format!("{now}::{action}");
        let value = serde_json::json!({
            "action": action,
            "scopes": scopes.iter().collect::<Vec<_>>(),
        })
        .to_string();

        self.store.with_connection(|conn| {
            crate::store::persistence::insert_memory(conn, "safety.audit", &key, &value, None, now)
        })?;
        Ok(())
    }
}

/// Runtime brake controller. Cheap to clone (wraps `Arc`s); safe to share across
/// the HTTP surface, the scheduler, and the CLI.
#[derive(Clone)]
pub struct Brake {
    store: Arc<Store>,
    audit: Option<Arc<dyn AuditSink>>,
    cache: Arc<RwLock<BrakeState>>,
}

impl Brake {
    /// Load the current state from storage (defaulting to disengaged/no scopes
    /// if the flag row doesn't exist yet) and cache it.
    pub fn load(store: Arc<Store>, audit: Option<Arc<dyn AuditSink>>) -> Result<Self, KernelError> {
        let initial = Self::read_state(&store)?;
        Ok(Self { store, audit, cache: Arc::new(RwLock::new(initial)) })
    }

    fn read_state(store: &Store) -> Result<BrakeState, KernelError> {
        let raw: Option<String> = store.with_connection(|conn| {
            conn.query_row(
                "SELECT value FROM system_flags WHERE key = ?1",
                [FLAG_KEY],
                |row| row.get(0),
            )
            .optional_to_kernel()
        })?;

        let row: BrakeRow = match raw {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| KernelError::Persistence(format!("corrupt brake flag: {e}")))?,
            None => BrakeRow { engaged: false, scopes: vec![] },
        };

        Ok(BrakeState { engaged: row.engaged, scopes: row.scopes.into_iter().collect() })
    }

    pub fn state(&self) -> BrakeState {
        self.cache.read().expect("brake cache lock poisoned").clone()
    }

    /// Engage the brake for the given scopes. Empty scopes defaults to `global`.
    pub fn engage(&self, scopes: &[String]) -> Result<BrakeState, KernelError> {
        let scopes: BTreeSet<String> = if scopes.is_empty() {
            ["global".to_string()].into_iter().collect()
        } else {
            scopes.iter().cloned().collect()
        };
        self.write(true, scopes)
    }

    pub fn disengage(&self) -> Result<BrakeState, KernelError> {
        self.write(false, BTreeSet::new())
    }

    fn write(&self, engaged: bool, scopes: BTreeSet<String>) -> Result<BrakeState, KernelError> {
        let row = BrakeRow { engaged, scopes: scopes.iter().cloned().collect() };
        let payload = serde_json::to_string(&row).map_err(|e| KernelError::Persistence(e.to_string()))?;
        let now = chrono::Utc::now().timestamp();

        self.store.with_connection(|conn| {
            conn.execute(
                "INSERT INTO system_flags(key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                rusqlite::params![FLAG_KEY, payload, now],
            )
            .map_err(|e| KernelError::Persistence(e.to_string()))
        })?;

        let new_state = BrakeState { engaged, scopes: scopes.clone() };
        *self.cache.write().expect("brake cache lock poisoned") = new_state.clone();

        if let Some(audit) = &self.audit {
            let action = if engaged { "engaged" } else { "disengaged" };
            if let Err(e) = audit.record(action, &scopes) {
                tracing::warn!("brake audit record failed: {e}");
            }
        }

        Ok(new_state)
    }

    /// Returns true if the given scope is currently blocked. `global` in the
    /// scope set supersedes every other scope.
    pub fn is_blocked(&self, scope: &str) -> bool {
        let st = self.state();
        st.engaged && (st.scopes.contains("global") || st.scopes.contains(scope))
    }
}

/// Small adapter so `rusqlite`'s `QueryReturnedNoRows` maps to `Ok(None)`
/// instead of propagating as an error, matching `.optional()` but returning a
/// `KernelError` instead of `rusqlite::Error`.
trait OptionalToKernel<T> {
    fn optional_to_kernel(self) -> Result<Option<T>, KernelError>;
}

impl<T> OptionalToKernel<T> for rusqlite::Result<T> {
    fn optional_to_kernel(self) -> Result<Option<T>, KernelError> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(KernelError::Persistence(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopAudit;
    impl AuditSink for NoopAudit {
        fn record(&self, _action: &str, _scopes: &BTreeSet<String>) -> Result<(), KernelError> {
            Ok(())
        }
    }

    fn open_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path().join("barth.db")).unwrap());
        (dir, store)
    }

    #[test]
    fn defaults_to_disengaged() {
        let (_dir, store) = open_store();
        let brake = Brake::load(store, None).unwrap();
        assert!(!brake.state().engaged);
        assert!(!brake.is_blocked("scheduler"));
    }

    #[test]
    fn engage_with_no_scopes_defaults_to_global_and_blocks_everything() {
        let (_dir, store) = open_store();
        let brake = Brake::load(store, None).unwrap();
        brake.engage(&[]).unwrap();
        assert!(brake.is_blocked("scheduler"));
        assert!(brake.is_blocked("skills"));
    }

    #[test]
    fn engage_with_specific_scope_does_not_block_others() {
        let (_dir, store) = open_store();
        let brake = Brake::load(store, None).unwrap();
        brake.engage(&["skills".to_string()]).unwrap();
        assert!(brake.is_blocked("skills"));
        assert!(!brake.is_blocked("scheduler"));
    }

    #[test]
    fn disengage_clears_all_blocks() {
        let (_dir, store) = open_store();
        let brake = Brake::load(store, None).unwrap();
        brake.engage(&[]).unwrap();
        brake.disengage().unwrap();
        assert!(!brake.is_blocked("global"));
        assert!(!brake.is_blocked("scheduler"));
    }

    #[test]
    fn state_persists_across_reload() {
        let (_dir, store) = open_store();
        {
            let brake = Brake::load(store.clone(), None).unwrap();
            brake.engage(&["scheduler".to_string()]).unwrap();
        }
        let reloaded = Brake::load(store, None).unwrap();
        assert!(reloaded.is_blocked("scheduler"));
    }

    #[test]
    fn audit_failure_does_not_block_brake_mutation() {
        struct FailingAudit;
        impl AuditSink for FailingAudit {
            fn record(&self, _action: &str, _scopes: &BTreeSet<String>) -> Result<(), KernelError> {
                Err(KernelError::Persistence("audit backend down".to_string()))
            }
        }
        let (_dir, store) = open_store();
        let brake = Brake::load(store, Some(Arc::new(FailingAudit))).unwrap();
        let result = brake.engage(&[]);
        assert!(result.is_ok());
        assert!(brake.is_blocked("global"));
    }

    #[test]
    fn audit_sink_is_optional() {
        let (_dir, store) = open_store();
        let brake = Brake::load(store, Some(Arc::new(NoopAudit))).unwrap();
        assert!(brake.engage(&[]).is_ok());
    }
}
