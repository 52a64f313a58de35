//! Persistent record store for backups, restores and restore-test results.

pub mod migrations;
pub mod sqlite;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, VaultError};
use crate::model::{BackupRecord, RestoreRecord, RestoreTestResult, RunLock, RunStatus};

pub use self::sqlite::SqliteCatalog;

pub trait Catalog: Send + Sync {
    fn insert_backup(&self, record: &BackupRecord) -> Result<()>;
    fn update_backup(&self, record: &BackupRecord) -> Result<()>;
    fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>>;
    /// All records of one database, oldest first.
    fn list_backups(&self, database_id: Uuid) -> Result<Vec<BackupRecord>>;
    fn list_all_backups(&self) -> Result<Vec<BackupRecord>>;
    fn list_backups_by_status(&self, status: RunStatus) -> Result<Vec<BackupRecord>>;
    /// Delete a record together with its restores and test results.
    fn delete_backup(&self, id: Uuid) -> Result<()>;

    fn insert_restore(&self, record: &RestoreRecord) -> Result<()>;
    /// Finalize a restore. Records no longer `in_progress` are left untouched.
    fn update_restore(&self, record: &RestoreRecord) -> Result<()>;
    fn get_restore(&self, id: Uuid) -> Result<Option<RestoreRecord>>;
    fn list_restores_by_status(&self, status: RunStatus) -> Result<Vec<RestoreRecord>>;

    fn insert_test_result(&self, result: &RestoreTestResult) -> Result<()>;
    fn latest_test_result(&self, backup_id: Uuid) -> Result<Option<RestoreTestResult>>;
    fn list_test_results(&self, backup_id: Uuid) -> Result<Vec<RestoreTestResult>>;

    /// Claim `lock.database_id` unless a live claim exists. Claims acquired
    /// before `stale_before` are taken over. Returns the live holder on conflict.
    fn acquire_run_lock(
        &self,
        lock: &RunLock,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<RunLock>>;
    fn release_run_lock(&self, database_id: Uuid, token: Uuid) -> Result<()>;
    fn run_lock(&self, database_id: Uuid) -> Result<Option<RunLock>>;
}

/// Fetch a backup record or fail with `BackupNotFound`.
pub fn require_backup(catalog: &dyn Catalog, id: Uuid) -> Result<BackupRecord> {
    catalog
        .get_backup(id)?
        .ok_or_else(|| VaultError::BackupNotFound(id.to_string()))
}

/// Resolve a full id or a unique id prefix (as printed by `list`).
pub fn find_backup_by_prefix(catalog: &dyn Catalog, prefix: &str) -> Result<BackupRecord> {
    if let Ok(id) = Uuid::parse_str(prefix) {
        return require_backup(catalog, id);
    }
    let needle = prefix.to_ascii_lowercase().replace('-', "");
    let mut matches: Vec<BackupRecord> = catalog
        .list_all_backups()?
        .into_iter()
        .filter(|r| r.id.simple().to_string().starts_with(&needle))
        .collect();
    match matches.len() {
        0 => Err(VaultError::BackupNotFound(prefix.to_string())),
        1 => Ok(matches.remove(0)),
        n => Err(VaultError::Config(format!(
            "backup id prefix '{prefix}' is ambiguous ({n} matches)"
        ))),
    }
}
