use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use tracing::{info, warn};
use uuid::Uuid;

use crate::app::Vault;
use crate::cancel::CancelToken;
use crate::chain;
use crate::config::{CompressionAlgorithm, DatabaseConfig};
use crate::engine::DumpRequest;
use crate::error::{Result, VaultError};
use crate::model::{
    BackupRecord, BackupType, DatabaseHandle, EngineMetadata, ReplicationState, RunStatus,
    timestamp_now,
};
use crate::notify::{EventKind, RunEvent};
use crate::pipeline::compress::CompressionSettings;
use crate::pipeline::{self, SealOptions};
use crate::storage::{artifact_key, temp_key};

#[derive(Debug, Clone, Default)]
pub struct BackupOptions {
    pub compress: bool,
    pub encrypt: bool,
    /// Regions to copy the artifact to after it is stored in the primary.
    pub replicate_to: Vec<String>,
}

impl BackupOptions {
    /// Options implied by the config for one database.
    pub fn for_database(vault: &Vault, db: &DatabaseConfig) -> Self {
        Self {
            compress: vault.config.compression.algorithm != CompressionAlgorithm::None,
            encrypt: vault.config.encryption.enabled,
            replicate_to: db.replicate_to.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupState {
    Starting,
    Dumping,
    Transforming,
    Uploading,
    Replicating,
    Completed,
    Failed,
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupState::Starting => "starting",
            BackupState::Dumping => "dumping",
            BackupState::Transforming => "transforming",
            BackupState::Uploading => "uploading",
            BackupState::Replicating => "replicating",
            BackupState::Completed => "completed",
            BackupState::Failed => "failed",
        })
    }
}

fn transition(record: &BackupRecord, state: BackupState) {
    info!(
        database = %record.database_name,
        backup_id = %record.id,
        backup_type = %record.backup_type,
        state = %state,
        "backup state"
    );
}

/// Take one backup of `handle`.
///
/// The record is persisted `in_progress` before the engine is touched and is
/// always finalized, so a returned error has a matching `failed` record.
/// Only a held database lock fails before any record exists.
pub fn run_backup(
    vault: &Vault,
    handle: &DatabaseHandle,
    backup_type: BackupType,
    opts: &BackupOptions,
    cancel: &CancelToken,
) -> Result<BackupRecord> {
    let _lock = vault.locks.try_acquire(handle.id, "backup")?;

    let id = Uuid::new_v4();
    let created_at = timestamp_now();
    let mut record = BackupRecord {
        id,
        database_id: handle.id,
        database_name: handle.database.clone(),
        engine: handle.engine,
        backup_type,
        storage_key: artifact_key(handle.engine, &handle.database, created_at, backup_type, id),
        size_bytes: 0,
        checksum: None,
        compression_applied: false,
        encryption_applied: false,
        engine_metadata: EngineMetadata::default(),
        replication_status: opts
            .replicate_to
            .iter()
            .map(|region| (region.clone(), ReplicationState::Pending))
            .collect::<BTreeMap<_, _>>(),
        status: RunStatus::InProgress,
        failure_reason: None,
        created_at,
        completed_at: None,
    };
    vault.catalog.insert_backup(&record)?;
    transition(&record, BackupState::Starting);

    match produce_artifact(vault, handle, &mut record, opts, cancel) {
        Ok(scratch) => {
            replicate(vault, &mut record, opts, scratch.path(), cancel);
            transition(&record, BackupState::Completed);
            vault.notifier.notify(
                &RunEvent::new(EventKind::BackupCompleted, &record.database_name).backup(record.id),
            );
            Ok(record)
        }
        Err(e) => {
            fail_record(vault, &mut record, &e);
            Err(e)
        }
    }
}

/// Dump, seal and store the artifact, then mark the record completed.
/// Returns the scratch directory so replication can reuse it.
fn produce_artifact(
    vault: &Vault,
    handle: &DatabaseHandle,
    record: &mut BackupRecord,
    opts: &BackupOptions,
    cancel: &CancelToken,
) -> Result<tempfile::TempDir> {
    let adapter = vault.adapter(handle.engine)?;
    let ctx = vault.exec_context(handle.engine, cancel);

    let parent = match record.backup_type {
        BackupType::Full => None,
        BackupType::Incremental => {
            let records = vault.catalog.list_backups(handle.id)?;
            Some(chain::incremental_parent(&records, adapter.as_ref())?)
        }
    };
    let since = match &parent {
        Some(p) => Some(p.engine_metadata.marker.clone().ok_or_else(|| {
            VaultError::NoBaseBackup(format!("backup {} has no end marker", p.short_id()))
        })?),
        None => None,
    };

    let scratch = vault.scratch_dir("backup-")?;
    let raw = scratch.path().join("raw");

    transition(record, BackupState::Dumping);
    cancel.check()?;
    let mut metadata = adapter.dump(
        &DumpRequest {
            handle,
            backup_type: record.backup_type,
            since: since.as_ref(),
            output: &raw,
        },
        &ctx,
    )?;

    if let (Some(parent), Some(since)) = (&parent, &since) {
        let end = metadata
            .marker
            .as_ref()
            .ok_or_else(|| VaultError::InvalidFormat("incremental dump returned no end marker".into()))?;
        if adapter.compare_markers(end, since)? != Ordering::Greater {
            return Err(VaultError::NoNewEntries);
        }
        metadata.parent_backup_id = Some(parent.id);
        metadata.since_marker = Some(since.clone());
    }

    transition(record, BackupState::Transforming);
    cancel.check()?;
    let seal_opts = SealOptions {
        compression: opts
            .compress
            .then(|| CompressionSettings::from_config(&vault.config.compression)),
        encrypt: opts.encrypt,
    };
    let sealed = pipeline::seal(
        &raw,
        &scratch.path().join("sealed"),
        &seal_opts,
        vault.keyring.as_ref(),
        cancel,
    )?;
    std::fs::remove_file(&raw)?;
    metadata.compression = sealed.compression.map(str::to_string);
    metadata.encryption_key_id = sealed.encryption_key_id.clone();

    transition(record, BackupState::Uploading);
    vault
        .store
        .upload_staged(&record.storage_key, &sealed.path, cancel)?;

    record.size_bytes = sealed.size_bytes;
    record.checksum = Some(sealed.checksum);
    record.compression_applied = sealed.compression.is_some();
    record.encryption_applied = sealed.encryption_key_id.is_some();
    record.engine_metadata = metadata;
    record.status = RunStatus::Completed;
    record.completed_at = Some(timestamp_now());
    vault.catalog.update_backup(record)?;
    Ok(scratch)
}

/// Best-effort copy to every requested region. Never changes `status`.
fn replicate(
    vault: &Vault,
    record: &mut BackupRecord,
    opts: &BackupOptions,
    scratch: &std::path::Path,
    cancel: &CancelToken,
) {
    if opts.replicate_to.is_empty() {
        return;
    }
    transition(record, BackupState::Replicating);
    let primary = vault.store.primary_region().to_string();
    for region in &opts.replicate_to {
        let state = vault
            .store
            .copy(&record.storage_key, &primary, region, scratch, cancel);
        if let ReplicationState::Failed(ref reason) = state {
            vault.notifier.notify(
                &RunEvent::new(EventKind::ReplicationFailed, &record.database_name)
                    .backup(record.id)
                    .error(format!("{region}: {reason}")),
            );
        }
        record.replication_status.insert(region.clone(), state);
    }
    if let Err(e) = vault.catalog.update_backup(record) {
        warn!(backup_id = %record.id, error = %e, "failed to persist replication status");
    }
}

fn fail_record(vault: &Vault, record: &mut BackupRecord, error: &VaultError) {
    transition(record, BackupState::Failed);
    warn!(
        database = %record.database_name,
        backup_id = %record.id,
        error = %error,
        "backup failed"
    );

    // A failed record owns nothing in storage, promoted or not.
    for key in [temp_key(&record.storage_key), record.storage_key.clone()] {
        if let Err(e) = vault.store.delete(&key, vault.store.primary_region()) {
            warn!(key = %key, error = %e, "failed to remove object of failed backup");
        }
    }

    record.status = RunStatus::Failed;
    record.failure_reason = Some(error.failure_reason());
    record.completed_at = Some(timestamp_now());
    if let Err(e) = vault.catalog.update_backup(record) {
        warn!(backup_id = %record.id, error = %e, "failed to persist backup failure");
    }
    vault.notifier.notify(
        &RunEvent::new(EventKind::BackupFailed, &record.database_name)
            .backup(record.id)
            .error(error.to_string()),
    );
}
