use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::{Result, VaultError};
use crate::model::RunLock;

#[derive(Debug, Clone)]
struct Holder {
    purpose: String,
    since: DateTime<Utc>,
}

/// Claims stored in the catalog, seen by every process sharing it.
#[derive(Clone)]
struct SharedClaims {
    catalog: Arc<dyn Catalog>,
    /// Claims older than this belong to a dead process and are taken over.
    stale_after: Duration,
}

impl SharedClaims {
    fn stale_before(&self) -> DateTime<Utc> {
        Utc::now() - self.stale_after
    }
}

/// Exclusive per-database run tokens. Acquisition never waits: a second
/// run for the same database fails with `Locked` and the caller decides.
///
/// The in-memory map covers runs of this process. When built with
/// [`DatabaseLocks::shared`] each claim is also recorded in the catalog, so
/// the CLI and a running daemon exclude each other.
#[derive(Clone, Default)]
pub struct DatabaseLocks {
    held: Arc<Mutex<HashMap<Uuid, Holder>>>,
    shared: Option<SharedClaims>,
}

impl fmt::Debug for DatabaseLocks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseLocks")
            .field("held", &lock_map(&self.held).len())
            .field("shared", &self.shared.is_some())
            .finish()
    }
}

/// Held for the duration of one run; released on drop.
pub struct DatabaseLockGuard {
    database_id: Uuid,
    token: Uuid,
    held: Arc<Mutex<HashMap<Uuid, Holder>>>,
    shared: Option<Arc<dyn Catalog>>,
}

impl fmt::Debug for DatabaseLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseLockGuard")
            .field("database_id", &self.database_id)
            .field("token", &self.token)
            .finish()
    }
}

impl DatabaseLockGuard {
    pub fn database_id(&self) -> Uuid {
        self.database_id
    }
}

fn lock_map(held: &Mutex<HashMap<Uuid, Holder>>) -> MutexGuard<'_, HashMap<Uuid, Holder>> {
    // A panic while holding the map cannot leave it half-updated.
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl DatabaseLocks {
    /// Process-local locks only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks also recorded in `catalog`, with claims older than `stale_after`
    /// considered abandoned.
    pub fn shared(catalog: Arc<dyn Catalog>, stale_after: Duration) -> Self {
        Self {
            held: Arc::default(),
            shared: Some(SharedClaims {
                catalog,
                stale_after,
            }),
        }
    }

    pub fn try_acquire(&self, database_id: Uuid, purpose: &str) -> Result<DatabaseLockGuard> {
        let mut map = lock_map(&self.held);
        if let Some(holder) = map.get(&database_id) {
            return Err(VaultError::Locked(format!(
                "{} since {}",
                holder.purpose,
                holder.since.to_rfc3339()
            )));
        }

        let now = Utc::now();
        let token = Uuid::new_v4();
        if let Some(shared) = &self.shared {
            let claim = RunLock {
                database_id,
                token,
                purpose: purpose.to_string(),
                hostname: crate::platform::hostname(),
                pid: std::process::id(),
                acquired_at: now,
            };
            if let Some(holder) = shared
                .catalog
                .acquire_run_lock(&claim, shared.stale_before())?
            {
                return Err(VaultError::Locked(holder.to_string()));
            }
        }

        map.insert(
            database_id,
            Holder {
                purpose: purpose.to_string(),
                since: now,
            },
        );
        debug!(database_id = %database_id, purpose, "acquired database lock");
        Ok(DatabaseLockGuard {
            database_id,
            token,
            held: Arc::clone(&self.held),
            shared: self.shared.as_ref().map(|s| Arc::clone(&s.catalog)),
        })
    }

    /// Whether a live run holds `database_id`, here or in another process.
    /// A catalog that cannot be read counts as locked.
    pub fn is_locked(&self, database_id: Uuid) -> bool {
        if lock_map(&self.held).contains_key(&database_id) {
            return true;
        }
        let Some(shared) = &self.shared else {
            return false;
        };
        match shared.catalog.run_lock(database_id) {
            Ok(Some(claim)) => claim.acquired_at >= shared.stale_before(),
            Ok(None) => false,
            Err(e) => {
                warn!(database_id = %database_id, error = %e, "cannot read run lock");
                true
            }
        }
    }
}

impl Drop for DatabaseLockGuard {
    fn drop(&mut self) {
        if let Some(catalog) = &self.shared {
            if let Err(e) = catalog.release_run_lock(self.database_id, self.token) {
                warn!(database_id = %self.database_id, error = %e, "failed to release run lock");
            }
        }
        lock_map(&self.held).remove(&self.database_id);
        debug!(database_id = %self.database_id, "released database lock");
    }
}
