use tracing::{info, warn};

use crate::app::Vault;
use crate::config::parse_chrono_duration;
use crate::error::Result;
use crate::model::{RunStatus, timestamp_now};
use crate::notify::{EventKind, RunEvent};
use crate::storage::temp_key;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub backups_failed: usize,
    pub restores_failed: usize,
}

/// Fail `in_progress` records older than `watchdog.max_run_duration` and
/// remove their temporary objects.
///
/// Runs whose database is locked, by this process or another one sharing
/// the catalog, are left alone: they are still alive. A restore is locked
/// under its target database.
pub fn reconcile(vault: &Vault) -> Result<ReconcileStats> {
    let max_age = parse_chrono_duration(&vault.config.watchdog.max_run_duration)?;
    let now = timestamp_now();
    let cutoff = now - max_age;
    let reason = format!(
        "reconciled: still in progress after {}",
        vault.config.watchdog.max_run_duration
    );
    let mut stats = ReconcileStats::default();

    for mut record in vault.catalog.list_backups_by_status(RunStatus::InProgress)? {
        if record.created_at >= cutoff || vault.locks.is_locked(record.database_id) {
            continue;
        }
        let temp = temp_key(&record.storage_key);
        if let Err(e) = vault.store.delete(&temp, vault.store.primary_region()) {
            warn!(key = %temp, error = %e, "failed to remove temporary object");
        }
        record.status = RunStatus::Failed;
        record.failure_reason = Some(reason.clone());
        record.completed_at = Some(now);
        vault.catalog.update_backup(&record)?;
        warn!(
            database = %record.database_name,
            backup_id = %record.id,
            started = %record.created_at,
            "stale backup marked failed"
        );
        vault.notifier.notify(
            &RunEvent::new(EventKind::RunReconciled, &record.database_name)
                .backup(record.id)
                .error(reason.clone()),
        );
        stats.backups_failed += 1;
    }

    for mut restore in vault.catalog.list_restores_by_status(RunStatus::InProgress)? {
        if restore.started_at >= cutoff || vault.locks.is_locked(restore.database_id) {
            continue;
        }
        restore.status = RunStatus::Failed;
        restore.failure_reason = Some(reason.clone());
        restore.completed_at = Some(now);
        vault.catalog.update_restore(&restore)?;
        warn!(restore_id = %restore.id, started = %restore.started_at, "stale restore marked failed");
        let database = vault
            .catalog
            .get_backup(restore.backup_id)?
            .map(|b| b.database_name)
            .unwrap_or_default();
        vault.notifier.notify(
            &RunEvent::new(EventKind::RunReconciled, database)
                .backup(restore.backup_id)
                .restore(restore.id)
                .error(reason.clone()),
        );
        stats.restores_failed += 1;
    }

    if stats != ReconcileStats::default() {
        info!(
            backups = stats.backups_failed,
            restores = stats.restores_failed,
            "watchdog reconciled stale runs"
        );
    }
    Ok(stats)
}
