//! Retention policy over one database's backup records.
//!
//! Fulls are kept by the tiered bucket rules. Incrementals follow their
//! lineage: a retained incremental keeps every earlier incremental of its
//! lineage and pins the full it is rooted at.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, IsoWeek, Utc};
use uuid::Uuid;

use crate::chain::root_of;
use crate::config::{RetentionConfig, parse_chrono_duration};
use crate::error::{Result, VaultError};
use crate::model::{BackupRecord, BackupType, RunStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionDecision {
    Keep { reasons: Vec<String> },
    Prune { reason: String },
}

#[derive(Debug, Clone)]
pub struct RetentionEntry {
    pub record: BackupRecord,
    pub decision: RetentionDecision,
}

impl RetentionEntry {
    pub fn is_pruned(&self) -> bool {
        matches!(self.decision, RetentionDecision::Prune { .. })
    }
}

type DailyKey = (i32, u32); // (year, ordinal_day)
type WeeklyKey = (i32, u32); // (iso_year, iso_week)
type MonthlyKey = (i32, u32); // (year, month)
type YearlyKey = (i32,);

fn daily_key(t: &DateTime<Utc>) -> DailyKey {
    (t.year(), t.ordinal())
}

fn weekly_key(t: &DateTime<Utc>) -> WeeklyKey {
    let iw: IsoWeek = t.iso_week();
    (iw.year(), iw.week())
}

fn monthly_key(t: &DateTime<Utc>) -> MonthlyKey {
    (t.year(), t.month())
}

fn yearly_key(t: &DateTime<Utc>) -> YearlyKey {
    (t.year(),)
}

/// For each new bucket encountered (up to `max_buckets`), keep the newest
/// record in it. Records already kept by another rule still consume their
/// bucket.
fn apply_bucket_rule<K: Eq + std::hash::Hash>(
    fulls: &[&BackupRecord],
    kept: &mut HashSet<Uuid>,
    reasons: &mut HashMap<Uuid, Vec<String>>,
    max_buckets: usize,
    key_fn: impl Fn(&DateTime<Utc>) -> K,
    rule_name: &str,
) {
    let mut seen_buckets: HashSet<K> = HashSet::new();
    let mut kept_count = 0usize;

    for r in fulls {
        if kept_count >= max_buckets {
            break;
        }
        if !seen_buckets.insert(key_fn(&r.created_at)) {
            continue;
        }
        kept.insert(r.id);
        reasons
            .entry(r.id)
            .or_default()
            .push(format!("{rule_name} #{}", kept_count + 1));
        kept_count += 1;
    }
}

/// Decide keep/prune for every record of one database. Entries come back
/// newest first.
pub fn apply_policy(
    records: &[BackupRecord],
    policy: &RetentionConfig,
    now: DateTime<Utc>,
) -> Result<Vec<RetentionEntry>> {
    let mut kept: HashSet<Uuid> = HashSet::new();
    let mut reasons: HashMap<Uuid, Vec<String>> = HashMap::new();
    let mut pruned: HashMap<Uuid, String> = HashMap::new();

    // Completed fulls, newest first.
    let mut fulls: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| r.backup_type == BackupType::Full && r.is_completed())
        .collect();
    fulls.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    if let Some(ref within) = policy.keep_within {
        let cutoff = now - parse_chrono_duration(within)?;
        for r in fulls.iter().filter(|r| r.created_at >= cutoff) {
            kept.insert(r.id);
            reasons.entry(r.id).or_default().push("within".into());
        }
    }
    if let Some(n) = policy.keep_last {
        for (i, r) in fulls.iter().take(n).enumerate() {
            kept.insert(r.id);
            reasons
                .entry(r.id)
                .or_default()
                .push(format!("last #{}", i + 1));
        }
    }
    if let Some(n) = policy.keep_daily {
        apply_bucket_rule(&fulls, &mut kept, &mut reasons, n, daily_key, "daily");
    }
    if let Some(n) = policy.keep_weekly {
        apply_bucket_rule(&fulls, &mut kept, &mut reasons, n, weekly_key, "weekly");
    }
    if let Some(n) = policy.keep_monthly {
        apply_bucket_rule(&fulls, &mut kept, &mut reasons, n, monthly_key, "monthly");
    }
    if let Some(n) = policy.keep_yearly {
        apply_bucket_rule(&fulls, &mut kept, &mut reasons, n, yearly_key, "yearly");
    }

    // Incrementals, newest first, grouped by the full they are rooted at.
    let mut incrementals: Vec<&BackupRecord> = records
        .iter()
        .filter(|r| r.backup_type == BackupType::Incremental && r.is_completed())
        .collect();
    incrementals.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let incremental_cutoff = policy
        .keep_incrementals_within
        .as_deref()
        .map(parse_chrono_duration)
        .transpose()?
        .map(|d| now - d);

    let mut lineage_has_keeper: HashSet<Uuid> = HashSet::new();
    for inc in incrementals {
        let root = match root_of(records, inc) {
            Ok(root) if root.is_completed() => root,
            _ => {
                pruned.insert(inc.id, "orphaned incremental".into());
                continue;
            }
        };
        let reason = if lineage_has_keeper.contains(&root.id) {
            Some("needed by a newer incremental".to_string())
        } else {
            match incremental_cutoff {
                Some(cutoff) if inc.created_at >= cutoff => Some("incremental within".to_string()),
                Some(_) => None,
                // Without an incremental window they live as long as their full.
                None if kept.contains(&root.id) => Some("full retained".to_string()),
                None => None,
            }
        };
        match reason {
            Some(reason) => {
                lineage_has_keeper.insert(root.id);
                kept.insert(inc.id);
                reasons.entry(inc.id).or_default().push(reason);
                if kept.insert(root.id) {
                    reasons
                        .entry(root.id)
                        .or_default()
                        .push(format!("pinned by incremental {}", short(inc.id)));
                }
            }
            None => {
                pruned.insert(inc.id, "incremental expired".into());
            }
        }
    }

    if !fulls.is_empty() && fulls.iter().all(|r| !kept.contains(&r.id)) {
        return Err(VaultError::Other(format!(
            "refusing to prune: policy would remove every full backup of '{}'",
            fulls[0].database_name
        )));
    }
    for r in &fulls {
        if !kept.contains(&r.id) {
            pruned.insert(r.id, "outside every retention tier".into());
        }
    }

    let purge_cutoff = policy
        .purge_failed_after
        .as_deref()
        .map(parse_chrono_duration)
        .transpose()?
        .map(|d| now - d);

    let mut ordered: Vec<&BackupRecord> = records.iter().collect();
    ordered.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let entries = ordered
        .into_iter()
        .map(|r| {
            let decision = match r.status {
                RunStatus::InProgress => RetentionDecision::Keep {
                    reasons: vec!["in progress".into()],
                },
                RunStatus::Failed => match purge_cutoff {
                    Some(cutoff) if r.created_at < cutoff => RetentionDecision::Prune {
                        reason: "failed run".into(),
                    },
                    _ => RetentionDecision::Keep {
                        reasons: vec!["recent failure".into()],
                    },
                },
                RunStatus::Completed => match pruned.remove(&r.id) {
                    Some(reason) => RetentionDecision::Prune { reason },
                    None => RetentionDecision::Keep {
                        reasons: reasons.remove(&r.id).unwrap_or_default(),
                    },
                },
            };
            RetentionEntry {
                record: r.clone(),
                decision,
            }
        })
        .collect();
    Ok(entries)
}

fn short(id: Uuid) -> String {
    id.simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::record;
    use chrono::Duration;

    fn policy() -> RetentionConfig {
        RetentionConfig {
            purge_failed_after: Some("7d".into()),
            ..Default::default()
        }
    }

    fn decision_of(entries: &[RetentionEntry], id: Uuid) -> &RetentionDecision {
        &entries.iter().find(|e| e.record.id == id).unwrap().decision
    }

    #[test]
    fn keep_last_keeps_newest_fulls() {
        let now = Utc::now();
        let fulls: Vec<BackupRecord> = (0..4)
            .map(|d| record(BackupType::Full, now - Duration::days(d), None))
            .collect();
        let p = RetentionConfig {
            keep_last: Some(2),
            ..policy()
        };
        let entries = apply_policy(&fulls, &p, now).unwrap();
        let pruned: Vec<Uuid> = entries
            .iter()
            .filter(|e| e.is_pruned())
            .map(|e| e.record.id)
            .collect();
        assert_eq!(pruned, vec![fulls[2].id, fulls[3].id]);
    }

    #[test]
    fn expired_incremental_chain_unpins_its_full() {
        let now = Utc::now();
        let old_full = record(BackupType::Full, now - Duration::days(10), None);
        let old_inc = record(BackupType::Incremental, now - Duration::days(9), Some(&old_full));
        let new_full = record(BackupType::Full, now - Duration::hours(1), None);
        let p = RetentionConfig {
            keep_last: Some(1),
            keep_incrementals_within: Some("2d".into()),
            ..policy()
        };
        let records = vec![old_full.clone(), old_inc.clone(), new_full.clone()];
        let entries = apply_policy(&records, &p, now).unwrap();
        assert!(matches!(decision_of(&entries, old_full.id), RetentionDecision::Prune { .. }));
        assert!(matches!(decision_of(&entries, old_inc.id), RetentionDecision::Prune { .. }));
        assert!(matches!(decision_of(&entries, new_full.id), RetentionDecision::Keep { .. }));
    }

    #[test]
    fn older_incrementals_are_kept_for_a_retained_newer_one() {
        let now = Utc::now();
        let full = record(BackupType::Full, now - Duration::days(5), None);
        let inc1 = record(BackupType::Incremental, now - Duration::days(4), Some(&full));
        let inc2 = record(BackupType::Incremental, now - Duration::hours(2), Some(&inc1));
        let p = RetentionConfig {
            keep_last: Some(1),
            keep_incrementals_within: Some("1d".into()),
            ..policy()
        };
        let entries = apply_policy(&[full.clone(), inc1.clone(), inc2.clone()], &p, now).unwrap();
        for id in [full.id, inc1.id, inc2.id] {
            assert!(!entries.iter().find(|e| e.record.id == id).unwrap().is_pruned());
        }
    }

    #[test]
    fn refuses_to_remove_every_full() {
        let now = Utc::now();
        let old = record(BackupType::Full, now - Duration::days(30), None);
        let p = RetentionConfig {
            keep_within: Some("1d".into()),
            ..policy()
        };
        let err = apply_policy(&[old], &p, now).unwrap_err();
        assert!(err.to_string().contains("refusing to prune"));
    }

    #[test]
    fn old_failures_are_purged_and_in_progress_kept() {
        let now = Utc::now();
        let full = record(BackupType::Full, now, None);
        let mut failed_old = record(BackupType::Full, now - Duration::days(8), None);
        failed_old.status = RunStatus::Failed;
        let mut failed_new = record(BackupType::Full, now - Duration::days(1), None);
        failed_new.status = RunStatus::Failed;
        let mut running = record(BackupType::Full, now - Duration::days(20), None);
        running.status = RunStatus::InProgress;

        let p = RetentionConfig {
            keep_last: Some(1),
            ..policy()
        };
        let records = vec![
            full.clone(),
            failed_old.clone(),
            failed_new.clone(),
            running.clone(),
        ];
        let entries = apply_policy(&records, &p, now).unwrap();
        assert!(entries.iter().find(|e| e.record.id == failed_old.id).unwrap().is_pruned());
        assert!(!entries.iter().find(|e| e.record.id == failed_new.id).unwrap().is_pruned());
        assert!(!entries.iter().find(|e| e.record.id == running.id).unwrap().is_pruned());
    }
}
