use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::Vault;
use crate::cancel::CancelToken;
use crate::error::{Result, VaultError};
use crate::model::{BackupRecord, BackupType, RunStatus};
use crate::retention::{RetentionDecision, apply_policy};
use crate::storage::temp_key;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub kept: usize,
    pub pruned: usize,
    pub bytes_freed: u64,
    /// Records whose artifacts could not be deleted; they stay in the catalog.
    pub failed: usize,
    /// Databases left alone because they were busy or the policy refused.
    pub skipped_databases: Vec<String>,
}

/// Formatted list entry for `--list` output.
#[derive(Debug, Clone)]
pub struct PruneListEntry {
    pub action: &'static str,
    pub database: String,
    pub backup_id: Uuid,
    pub backup_type: BackupType,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub reasons: Vec<String>,
}

/// Apply the retention policy to every database, or to the named ones.
pub fn run(
    vault: &Vault,
    dry_run: bool,
    list: bool,
    database_filter: &[String],
    cancel: &CancelToken,
) -> Result<(PruneStats, Vec<PruneListEntry>)> {
    let policy = &vault.config.retention;
    if !policy.has_any_rule() {
        return Err(VaultError::Config(
            "no retention rules configured: set at least one keep_* option in the retention section"
                .into(),
        ));
    }
    let wanted: Vec<Uuid> = database_filter
        .iter()
        .map(|name| vault.config.database(name).map(|db| db.id))
        .collect::<Result<_>>()?;

    let mut by_database: BTreeMap<Uuid, Vec<BackupRecord>> = BTreeMap::new();
    for record in vault.catalog.list_all_backups()? {
        if wanted.is_empty() || wanted.contains(&record.database_id) {
            by_database.entry(record.database_id).or_default().push(record);
        }
    }

    let now = Utc::now();
    let mut stats = PruneStats::default();
    let mut listing = Vec::new();

    for (database_id, records) in by_database {
        cancel.check()?;
        let name = records
            .first()
            .map(|r| r.database_name.clone())
            .unwrap_or_default();

        let _lock = match vault.locks.try_acquire(database_id, "prune") {
            Ok(guard) => guard,
            Err(e) => {
                warn!(database = %name, error = %e, "skipping busy database");
                stats.skipped_databases.push(name);
                continue;
            }
        };
        let entries = match apply_policy(&records, policy, now) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(database = %name, error = %e, "retention policy not applied");
                stats.skipped_databases.push(name);
                continue;
            }
        };

        for entry in entries {
            let (action, reasons) = match &entry.decision {
                RetentionDecision::Keep { reasons } => ("keep", reasons.clone()),
                RetentionDecision::Prune { reason } => ("prune", vec![reason.clone()]),
            };
            if list || dry_run {
                listing.push(PruneListEntry {
                    action,
                    database: entry.record.database_name.clone(),
                    backup_id: entry.record.id,
                    backup_type: entry.record.backup_type,
                    status: entry.record.status,
                    created_at: entry.record.created_at,
                    reasons,
                });
            }
            if !entry.is_pruned() {
                stats.kept += 1;
                continue;
            }
            if dry_run {
                stats.pruned += 1;
                continue;
            }
            match delete_record(vault, &entry.record) {
                Ok(()) => {
                    stats.pruned += 1;
                    stats.bytes_freed += entry.record.size_bytes;
                }
                Err(e) => {
                    warn!(backup_id = %entry.record.id, error = %e, "failed to prune backup");
                    stats.failed += 1;
                }
            }
        }
    }

    info!(
        kept = stats.kept,
        pruned = stats.pruned,
        failed = stats.failed,
        bytes_freed = stats.bytes_freed,
        dry_run,
        "retention sweep finished"
    );
    Ok((stats, listing))
}

/// Remove every stored copy of a record, then the record itself. The row
/// survives any storage failure so the next sweep retries.
fn delete_record(vault: &Vault, record: &BackupRecord) -> Result<()> {
    let mut regions = vec![vault.store.primary_region().to_string()];
    regions.extend(record.replication_status.keys().cloned());
    for region in &regions {
        vault.store.delete(&record.storage_key, region)?;
        if record.status != RunStatus::Completed {
            vault.store.delete(&temp_key(&record.storage_key), region)?;
        }
    }
    vault.catalog.delete_backup(record.id)?;
    info!(
        database = %record.database_name,
        backup_id = %record.id,
        backup_type = %record.backup_type,
        "pruned backup"
    );
    Ok(())
}
