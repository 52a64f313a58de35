use chrono::{Duration, Utc};

use crate::cancel::CancelToken;
use crate::commands::prune;
use crate::error::VaultError;
use crate::model::{BackupRecord, BackupType, ReplicationState, RunStatus};
use crate::storage::temp_key;
use crate::testutil::{TEST_DB_ID, TestVault, record, test_vault, test_vault_with};

/// Catalog row plus its objects in both regions.
fn stored(tv: &TestVault, mut r: BackupRecord) -> BackupRecord {
    r.replication_status
        .insert("dr".into(), ReplicationState::Completed);
    tv.vault.catalog.insert_backup(&r).unwrap();
    tv.primary.insert(&r.storage_key, b"sealed");
    tv.replica.insert(&r.storage_key, b"sealed");
    r
}

fn three_daily_fulls(tv: &TestVault) -> Vec<BackupRecord> {
    let now = Utc::now();
    [3, 2, 1]
        .into_iter()
        .map(|days| stored(tv, record(BackupType::Full, now - Duration::days(days), None)))
        .collect()
}

#[test]
fn oldest_full_is_removed_from_every_region_and_catalog() {
    let tv = test_vault_with("retention:\n  keep_daily: 2");
    let fulls = three_daily_fulls(&tv);

    let (stats, listing) = prune::run(&tv.vault, false, false, &[], &CancelToken::new()).unwrap();
    assert_eq!(stats.pruned, 1);
    assert_eq!(stats.kept, 2);
    assert_eq!(stats.bytes_freed, fulls[0].size_bytes);
    assert!(listing.is_empty());

    assert!(tv.vault.catalog.get_backup(fulls[0].id).unwrap().is_none());
    assert!(tv.primary.get(&fulls[0].storage_key).is_none());
    assert!(tv.replica.get(&fulls[0].storage_key).is_none());
    for kept in &fulls[1..] {
        assert!(tv.vault.catalog.get_backup(kept.id).unwrap().is_some());
        assert!(tv.primary.get(&kept.storage_key).is_some());
        assert!(tv.replica.get(&kept.storage_key).is_some());
    }
}

#[test]
fn dry_run_lists_decisions_without_mutating() {
    let tv = test_vault_with("retention:\n  keep_daily: 2");
    let fulls = three_daily_fulls(&tv);

    let (stats, listing) = prune::run(&tv.vault, true, false, &[], &CancelToken::new()).unwrap();
    assert_eq!(stats.pruned, 1);
    assert_eq!(stats.bytes_freed, 0);
    assert_eq!(listing.len(), 3);

    let pruned: Vec<_> = listing.iter().filter(|e| e.action == "prune").collect();
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].backup_id, fulls[0].id);

    assert_eq!(tv.vault.catalog.list_backups(TEST_DB_ID).unwrap().len(), 3);
    assert_eq!(tv.primary.keys().len(), 3);
    assert_eq!(tv.replica.keys().len(), 3);
}

#[test]
fn pruning_without_rules_is_a_config_error() {
    let tv = test_vault();
    three_daily_fulls(&tv);
    let err = prune::run(&tv.vault, false, false, &[], &CancelToken::new()).unwrap_err();
    assert!(matches!(err, VaultError::Config(ref msg) if msg.contains("keep_")), "{err}");
    assert_eq!(tv.primary.keys().len(), 3);
}

#[test]
fn unknown_database_filter_is_rejected() {
    let tv = test_vault_with("retention:\n  keep_last: 1");
    let err = prune::run(
        &tv.vault,
        false,
        false,
        &["nope".to_string()],
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, VaultError::Config(_)));
}

#[test]
fn busy_database_is_skipped() {
    let tv = test_vault_with("retention:\n  keep_last: 1");
    three_daily_fulls(&tv);

    let _held = tv.vault.locks.try_acquire(TEST_DB_ID, "backup").unwrap();
    let (stats, _) = prune::run(&tv.vault, false, false, &[], &CancelToken::new()).unwrap();
    assert_eq!(stats.skipped_databases, vec!["orders".to_string()]);
    assert_eq!(stats.pruned, 0);
    assert_eq!(tv.primary.keys().len(), 3);
}

#[test]
fn incremental_keeps_its_expired_full() {
    let tv = test_vault_with("retention:\n  keep_last: 1\n  keep_incrementals_within: 7d");
    let now = Utc::now();
    let old_full = stored(&tv, record(BackupType::Full, now - Duration::days(3), None));
    let inc = stored(
        &tv,
        record(BackupType::Incremental, now - Duration::days(2), Some(&old_full)),
    );
    let new_full = stored(&tv, record(BackupType::Full, now - Duration::days(1), None));

    let (stats, _) = prune::run(&tv.vault, false, false, &[], &CancelToken::new()).unwrap();
    assert_eq!(stats.pruned, 0);
    for r in [&old_full, &inc, &new_full] {
        assert!(tv.vault.catalog.get_backup(r.id).unwrap().is_some());
    }
}

#[test]
fn old_failed_run_and_its_temporary_object_are_purged() {
    let tv = test_vault_with("retention:\n  keep_last: 1\n  purge_failed_after: 1d");
    let now = Utc::now();
    stored(&tv, record(BackupType::Full, now - Duration::hours(1), None));

    let mut failed = record(BackupType::Full, now - Duration::days(3), None);
    failed.status = RunStatus::Failed;
    failed.failure_reason = Some("engine_unreachable: refused".into());
    tv.vault.catalog.insert_backup(&failed).unwrap();
    tv.primary.insert(&temp_key(&failed.storage_key), b"partial");

    let (stats, _) = prune::run(&tv.vault, false, false, &[], &CancelToken::new()).unwrap();
    assert_eq!(stats.pruned, 1);
    assert!(tv.vault.catalog.get_backup(failed.id).unwrap().is_none());
    assert!(tv.primary.get(&temp_key(&failed.storage_key)).is_none());
}
