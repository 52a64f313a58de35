use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::Vault;
use crate::cancel::CancelToken;
use crate::catalog::require_backup;
use crate::chain::{self, ChainStep};
use crate::engine::ReplayStats;
use crate::error::{Result, VaultError};
use crate::model::{
    BackupRecord, BackupType, DatabaseHandle, ReplicationState, RestoreRecord, RunStatus,
    timestamp_now,
};
use crate::notify::{EventKind, RunEvent};
use crate::pipeline::checksum::verify_file;
use crate::pipeline::unseal;

pub struct RestoreRequest<'a> {
    pub backup_id: Uuid,
    /// Where to apply the chain. May be omitted only with `verify_only`.
    pub target: Option<&'a DatabaseHandle>,
    pub point_in_time: Option<DateTime<Utc>>,
    pub verify_only: bool,
}

#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub record: RestoreRecord,
    pub chain: Vec<ChainStep>,
    /// Replay entries applied and skipped across all incrementals.
    pub replay: ReplayStats,
}

/// Downloaded, verified artifact waiting to be applied.
struct Fetched {
    step: ChainStep,
    sealed: PathBuf,
}

pub fn run_restore(
    vault: &Vault,
    req: &RestoreRequest<'_>,
    cancel: &CancelToken,
) -> Result<RestoreOutcome> {
    let requested = require_backup(vault.catalog.as_ref(), req.backup_id)?;
    if !req.verify_only && req.target.is_none() {
        return Err(VaultError::Config(
            "a restore target is required unless verifying only".into(),
        ));
    }
    let _lock = match req.target {
        Some(target) => Some(vault.locks.try_acquire(target.id, "restore")?),
        None => None,
    };

    let mut record = RestoreRecord {
        id: Uuid::new_v4(),
        backup_id: requested.id,
        // Verify-only runs touch no database; they are filed under the source.
        database_id: req.target.map_or(requested.database_id, |t| t.id),
        point_in_time: req.point_in_time,
        verify_only: req.verify_only,
        status: RunStatus::InProgress,
        failure_reason: None,
        started_at: timestamp_now(),
        completed_at: None,
    };
    vault.catalog.insert_restore(&record)?;
    info!(
        restore_id = %record.id,
        backup_id = %requested.id,
        database = %requested.database_name,
        point_in_time = ?req.point_in_time,
        verify_only = req.verify_only,
        "restore started"
    );

    let result = execute(vault, req, &requested, cancel);
    record.completed_at = Some(timestamp_now());
    match result {
        Ok((chain, replay)) => {
            record.status = RunStatus::Completed;
            vault.catalog.update_restore(&record)?;
            info!(
                restore_id = %record.id,
                artifacts = chain.len(),
                replay_applied = replay.applied,
                replay_skipped = replay.skipped,
                "restore completed"
            );
            vault.notifier.notify(
                &RunEvent::new(EventKind::RestoreCompleted, &requested.database_name)
                    .backup(requested.id)
                    .restore(record.id),
            );
            Ok(RestoreOutcome {
                record,
                chain,
                replay,
            })
        }
        Err(e) => {
            warn!(restore_id = %record.id, error = %e, "restore failed");
            record.status = RunStatus::Failed;
            record.failure_reason = Some(e.failure_reason());
            if let Err(persist) = vault.catalog.update_restore(&record) {
                warn!(restore_id = %record.id, error = %persist, "failed to persist restore failure");
            }
            if let VaultError::IntegrityViolation { ref key, .. } = e {
                vault.notifier.notify(
                    &RunEvent::new(EventKind::IntegrityViolation, &requested.database_name)
                        .backup(requested.id)
                        .restore(record.id)
                        .error(format!("checksum mismatch for {key}")),
                );
            }
            vault.notifier.notify(
                &RunEvent::new(EventKind::RestoreFailed, &requested.database_name)
                    .backup(requested.id)
                    .restore(record.id)
                    .error(e.to_string()),
            );
            Err(e)
        }
    }
}

fn execute(
    vault: &Vault,
    req: &RestoreRequest<'_>,
    requested: &BackupRecord,
    cancel: &CancelToken,
) -> Result<(Vec<ChainStep>, ReplayStats)> {
    let adapter = vault.adapter(requested.engine)?;
    let records = vault.catalog.list_backups(requested.database_id)?;
    let steps = chain::resolve_chain(&records, requested, req.point_in_time, adapter.as_ref())?;

    let scratch = vault.scratch_dir("restore-")?;

    // Every artifact is fetched and verified before the target is touched.
    let mut fetched = Vec::with_capacity(steps.len());
    for (i, step) in steps.iter().enumerate() {
        cancel.check()?;
        let sealed = scratch.path().join(format!("{i:04}.sealed"));
        fetch_verified(vault, &step.record, &sealed, cancel)?;
        fetched.push(Fetched {
            step: step.clone(),
            sealed,
        });
    }
    if req.verify_only {
        return Ok((steps, ReplayStats::default()));
    }
    let target = req
        .target
        .ok_or_else(|| VaultError::Config("restore target missing".into()))?;

    let ctx = vault.exec_context(requested.engine, cancel);
    let mut totals = ReplayStats::default();
    for (i, item) in fetched.into_iter().enumerate() {
        cancel.check()?;
        let step = &item.step;
        let plain = scratch.path().join(format!("{i:04}.plain"));
        unseal(
            &item.sealed,
            &plain,
            step.record.compression_applied,
            step.record.encryption_applied,
            vault.keyring.as_ref(),
            cancel,
        )?;
        std::fs::remove_file(&item.sealed)?;

        match step.record.backup_type {
            BackupType::Full => {
                info!(backup_id = %step.record.id, "applying full dump");
                adapter.apply_dump(target, &plain, &step.record.engine_metadata, &ctx)?;
            }
            BackupType::Incremental => {
                info!(backup_id = %step.record.id, up_to = ?step.up_to, "applying replay segment");
                let stats = adapter.apply_replay_up_to(target, &plain, step.up_to, &ctx)?;
                totals.applied += stats.applied;
                totals.skipped += stats.skipped;
                if stats.last_applied_at.is_some() {
                    totals.last_applied_at = stats.last_applied_at;
                }
            }
        }
        std::fs::remove_file(&plain)?;
    }
    Ok((steps, totals))
}

/// Download the artifact of `record` into `dest` and check its digest.
///
/// The primary region is tried first; replicas that completed their copy
/// serve as fallbacks when the primary cannot deliver. A checksum mismatch
/// is never retried from another region.
fn fetch_verified(
    vault: &Vault,
    record: &BackupRecord,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<()> {
    let expected = record.checksum.as_deref().ok_or_else(|| {
        VaultError::InvalidFormat(format!("backup {} has no checksum", record.short_id()))
    })?;

    let mut regions = vec![vault.store.primary_region().to_string()];
    regions.extend(
        record
            .replication_status
            .iter()
            .filter(|(_, state)| **state == ReplicationState::Completed)
            .map(|(region, _)| region.clone()),
    );

    let mut last_err = None;
    for region in &regions {
        match vault
            .store
            .download_from(region, &record.storage_key, dest, cancel)
        {
            Ok(()) => {
                verify_file(dest, &record.storage_key, expected, cancel)?;
                return Ok(());
            }
            Err(e @ (VaultError::ArtifactMissing(_) | VaultError::StorageUnavailable(_))) => {
                warn!(region = %region, key = %record.storage_key, error = %e, "download failed");
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| VaultError::ArtifactMissing(record.storage_key.clone())))
}
