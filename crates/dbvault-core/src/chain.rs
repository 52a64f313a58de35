//! Lineages and restore chains.
//!
//! A lineage is a full record plus every completed incremental chained from
//! it, directly or transitively, in marker order.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::engine::EngineAdapter;
use crate::error::{Result, VaultError};
use crate::model::{BackupRecord, BackupType};

/// One artifact to apply during a restore.
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub record: BackupRecord,
    /// Incrementals only: stop after the last entry at or before this instant.
    pub up_to: Option<DateTime<Utc>>,
}

/// The full record `record` descends from.
pub fn root_of<'a>(records: &'a [BackupRecord], record: &'a BackupRecord) -> Result<&'a BackupRecord> {
    let by_id: HashMap<Uuid, &BackupRecord> = records.iter().map(|r| (r.id, r)).collect();
    let mut current = record;
    let mut hops = 0usize;
    while current.backup_type == BackupType::Incremental {
        let parent_id = current.engine_metadata.parent_backup_id.ok_or_else(|| {
            VaultError::InvalidFormat(format!("incremental {} has no parent", current.id))
        })?;
        current = by_id.get(&parent_id).copied().ok_or_else(|| {
            VaultError::NoCoverage(format!(
                "backup {} is missing from the chain of {}",
                parent_id, record.id
            ))
        })?;
        hops += 1;
        if hops > records.len() {
            return Err(VaultError::InvalidFormat(format!(
                "parent links of {} form a cycle",
                record.id
            )));
        }
    }
    Ok(current)
}

/// Completed records rooted at `full`: the full first, then its incrementals
/// in marker order.
pub fn lineage(
    records: &[BackupRecord],
    full: &BackupRecord,
    adapter: &dyn EngineAdapter,
) -> Result<Vec<BackupRecord>> {
    let mut incrementals = Vec::new();
    for r in records {
        if r.backup_type != BackupType::Incremental || !r.is_completed() {
            continue;
        }
        match root_of(records, r) {
            Ok(root) if root.id == full.id => incrementals.push(r.clone()),
            Ok(_) => {}
            // A broken link only detaches the tail, it does not poison the lineage.
            Err(VaultError::NoCoverage(_)) => {}
            Err(e) => return Err(e),
        }
    }
    sort_by_marker(&mut incrementals, adapter)?;

    let mut out = Vec::with_capacity(incrementals.len() + 1);
    out.push(full.clone());
    out.extend(incrementals);
    Ok(out)
}

fn sort_by_marker(records: &mut [BackupRecord], adapter: &dyn EngineAdapter) -> Result<()> {
    let mut failure = None;
    records.sort_by(|a, b| {
        match (&a.engine_metadata.marker, &b.engine_metadata.marker) {
            (Some(ma), Some(mb)) => adapter.compare_markers(ma, mb).unwrap_or_else(|e| {
                failure.get_or_insert(e);
                Ordering::Equal
            }),
            _ => a.created_at.cmp(&b.created_at),
        }
    });
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Parent for the next incremental of a database: the newest completed
/// record in the lineage of the newest completed full.
pub fn incremental_parent(
    records: &[BackupRecord],
    adapter: &dyn EngineAdapter,
) -> Result<BackupRecord> {
    let full = records
        .iter()
        .filter(|r| r.backup_type == BackupType::Full && r.is_completed())
        .max_by_key(|r| r.created_at)
        .ok_or_else(|| VaultError::NoBaseBackup("no completed full backup".into()))?;
    if !full.engine_metadata.pitr_capable || full.engine_metadata.marker.is_none() {
        return Err(VaultError::NoBaseBackup(format!(
            "newest full backup {} is not point-in-time capable",
            full.short_id()
        )));
    }
    let mut chain = lineage(records, full, adapter)?;
    chain
        .pop()
        .ok_or_else(|| VaultError::NoBaseBackup("empty lineage".into()))
}

/// Artifacts to apply, in order, to restore `requested`.
///
/// Without a point in time the chain is the requested record's ancestry.
/// With one, the lineage is walked forward and every segment with entries at
/// or before the target is included; the last included incremental is
/// applied only up to the target.
pub fn resolve_chain(
    records: &[BackupRecord],
    requested: &BackupRecord,
    point_in_time: Option<DateTime<Utc>>,
    adapter: &dyn EngineAdapter,
) -> Result<Vec<ChainStep>> {
    if !requested.is_completed() {
        return Err(VaultError::BackupNotFound(format!(
            "backup {} is {}, not completed",
            requested.id, requested.status
        )));
    }
    let full = root_of(records, requested)?;
    if !full.is_completed() {
        return Err(VaultError::NoCoverage(format!(
            "full backup {} of this chain is {}",
            full.id, full.status
        )));
    }

    let Some(target) = point_in_time else {
        return ancestry(records, requested);
    };

    if !adapter.pitr_capable() || !full.engine_metadata.pitr_capable {
        return Err(VaultError::NoCoverage(format!(
            "{} backups are not point-in-time capable",
            full.engine
        )));
    }
    let starts = full.covered_until().unwrap_or(full.created_at);
    if target < starts {
        return Err(VaultError::NoCoverage(format!(
            "{target} precedes full backup {} taken at {starts}",
            full.short_id()
        )));
    }

    let segments = lineage(records, full, adapter)?;
    let ends = segments
        .last()
        .and_then(BackupRecord::covered_until)
        .unwrap_or(starts);
    if target > ends {
        return Err(VaultError::NoCoverage(format!(
            "{target} is after the newest covered instant {ends}"
        )));
    }

    let mut steps = vec![ChainStep {
        record: full.clone(),
        up_to: None,
    }];
    for segment in segments.into_iter().skip(1) {
        let Some(first) = segment.engine_metadata.first_entry_at else {
            // Nothing to apply; keep walking unless it already reaches the target.
            if segment.covered_until().is_some_and(|c| c >= target) {
                break;
            }
            continue;
        };
        if first > target {
            break;
        }
        let reaches = segment.covered_until().is_some_and(|c| c >= target);
        steps.push(ChainStep {
            record: segment,
            up_to: None,
        });
        if reaches {
            break;
        }
    }
    if let Some(last) = steps.last_mut().filter(|s| s.record.backup_type == BackupType::Incremental)
    {
        last.up_to = Some(target);
    }
    Ok(steps)
}

fn ancestry(records: &[BackupRecord], requested: &BackupRecord) -> Result<Vec<ChainStep>> {
    let by_id: HashMap<Uuid, &BackupRecord> = records.iter().map(|r| (r.id, r)).collect();
    let mut chain = vec![requested.clone()];
    let mut current = requested;
    while let Some(parent_id) = current
        .engine_metadata
        .parent_backup_id
        .filter(|_| current.backup_type == BackupType::Incremental)
    {
        let parent = by_id.get(&parent_id).copied().ok_or_else(|| {
            VaultError::NoCoverage(format!("parent backup {parent_id} is missing"))
        })?;
        if !parent.is_completed() {
            return Err(VaultError::NoCoverage(format!(
                "parent backup {} is {}",
                parent.short_id(),
                parent.status
            )));
        }
        chain.push(parent.clone());
        current = parent;
    }
    chain.reverse();
    Ok(chain
        .into_iter()
        .map(|record| ChainStep { record, up_to: None })
        .collect())
}
