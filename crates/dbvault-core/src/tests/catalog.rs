use std::collections::BTreeMap;

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use crate::catalog::{Catalog, SqliteCatalog, find_backup_by_prefix, require_backup};
use crate::error::VaultError;
use crate::model::{
    BackupType, CheckOutcome, ReplicationState, RestoreRecord, RestoreTestResult, RunStatus,
};
use crate::testutil::{TEST_DB_ID, record};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 250_000_000).unwrap()
}

fn restore_of(backup_id: Uuid, status: RunStatus) -> RestoreRecord {
    RestoreRecord {
        id: Uuid::new_v4(),
        backup_id,
        database_id: TEST_DB_ID,
        point_in_time: Some(at(30)),
        verify_only: false,
        status,
        failure_reason: None,
        started_at: at(40),
        completed_at: None,
    }
}

fn test_result(backup_id: Uuid, passed: bool, tested_at: DateTime<Utc>) -> RestoreTestResult {
    RestoreTestResult {
        id: Uuid::new_v4(),
        backup_id,
        passed,
        checks: BTreeMap::from([(
            "restore".to_string(),
            if passed {
                CheckOutcome::pass("applied 1 artifacts")
            } else {
                CheckOutcome::fail("boom")
            },
        )]),
        tested_at,
    }
}

#[test]
fn backup_record_round_trips() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let full = record(BackupType::Full, at(10), None);
    let mut inc = record(BackupType::Incremental, at(20), Some(&full));
    inc.checksum = Some("ab".repeat(32));
    inc.compression_applied = true;
    inc.encryption_applied = true;
    inc.engine_metadata.first_entry_at = Some(at(11));
    inc.engine_metadata.entry_count = Some(4);
    inc.replication_status = BTreeMap::from([
        ("dr".to_string(), ReplicationState::Completed),
        ("eu".to_string(), ReplicationState::Failed("timeout".into())),
    ]);

    catalog.insert_backup(&full).unwrap();
    catalog.insert_backup(&inc).unwrap();
    assert_eq!(catalog.get_backup(inc.id).unwrap().unwrap(), inc);
    assert_eq!(catalog.get_backup(full.id).unwrap().unwrap(), full);
    assert!(catalog.get_backup(Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn update_changes_status_and_reason() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let mut r = record(BackupType::Full, at(10), None);
    r.status = RunStatus::InProgress;
    r.completed_at = None;
    catalog.insert_backup(&r).unwrap();

    r.status = RunStatus::Failed;
    r.failure_reason = Some("cancelled: operation cancelled".into());
    r.completed_at = Some(at(12));
    catalog.update_backup(&r).unwrap();

    assert_eq!(catalog.get_backup(r.id).unwrap().unwrap(), r);
    assert!(catalog.list_backups_by_status(RunStatus::InProgress).unwrap().is_empty());
    assert_eq!(catalog.list_backups_by_status(RunStatus::Failed).unwrap().len(), 1);
}

#[test]
fn listings_are_ordered_by_creation() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    for secs in [30, 10, 20] {
        catalog
            .insert_backup(&record(BackupType::Full, at(secs), None))
            .unwrap();
    }
    let mut other = record(BackupType::Full, at(15), None);
    other.database_id = Uuid::new_v4();
    catalog.insert_backup(&other).unwrap();

    let created: Vec<_> = catalog
        .list_backups(TEST_DB_ID)
        .unwrap()
        .into_iter()
        .map(|r| r.created_at)
        .collect();
    assert_eq!(created, vec![at(10), at(20), at(30)]);
    assert_eq!(catalog.list_all_backups().unwrap().len(), 4);
    assert_eq!(catalog.list_all_backups().unwrap()[1].id, other.id);
}

#[test]
fn deleting_a_backup_removes_its_restores_and_tests() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let full = record(BackupType::Full, at(10), None);
    catalog.insert_backup(&full).unwrap();
    let restore = restore_of(full.id, RunStatus::Completed);
    catalog.insert_restore(&restore).unwrap();
    catalog
        .insert_test_result(&test_result(full.id, true, at(50)))
        .unwrap();

    catalog.delete_backup(full.id).unwrap();
    assert!(catalog.get_backup(full.id).unwrap().is_none());
    assert!(catalog.get_restore(restore.id).unwrap().is_none());
    assert!(catalog.list_test_results(full.id).unwrap().is_empty());
}

#[test]
fn restores_are_queried_by_status() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let full = record(BackupType::Full, at(10), None);
    catalog.insert_backup(&full).unwrap();

    let mut running = restore_of(full.id, RunStatus::InProgress);
    catalog.insert_restore(&running).unwrap();
    catalog
        .insert_restore(&restore_of(full.id, RunStatus::Completed))
        .unwrap();

    let in_progress = catalog.list_restores_by_status(RunStatus::InProgress).unwrap();
    assert_eq!(in_progress, vec![running.clone()]);

    running.status = RunStatus::Failed;
    running.failure_reason = Some("integrity_violation: mismatch".into());
    running.completed_at = Some(at(45));
    catalog.update_restore(&running).unwrap();
    assert_eq!(catalog.get_restore(running.id).unwrap().unwrap(), running);
    assert!(catalog.list_restores_by_status(RunStatus::InProgress).unwrap().is_empty());
}

#[test]
fn latest_test_result_is_the_newest() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let full = record(BackupType::Full, at(10), None);
    catalog.insert_backup(&full).unwrap();
    assert!(catalog.latest_test_result(full.id).unwrap().is_none());

    let newer = test_result(full.id, false, at(100));
    catalog
        .insert_test_result(&test_result(full.id, true, at(50)))
        .unwrap();
    catalog.insert_test_result(&newer).unwrap();

    assert_eq!(catalog.latest_test_result(full.id).unwrap().unwrap(), newer);
    assert_eq!(catalog.list_test_results(full.id).unwrap().len(), 2);
}

#[test]
fn lookup_by_id_prefix() {
    let catalog = SqliteCatalog::open_in_memory().unwrap();
    let full = record(BackupType::Full, at(10), None);
    catalog.insert_backup(&full).unwrap();

    let prefix = &full.id.to_string()[..8];
    assert_eq!(find_backup_by_prefix(&catalog, prefix).unwrap().id, full.id);
    assert!(matches!(
        require_backup(&catalog, Uuid::new_v4()),
        Err(VaultError::BackupNotFound(_))
    ));
}

#[test]
fn reopening_a_file_catalog_keeps_records() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("catalog.sqlite");
    let full = record(BackupType::Full, Utc::now() - Duration::hours(1), None);
    {
        let catalog = SqliteCatalog::open(&path).unwrap();
        catalog.insert_backup(&full).unwrap();
    }
    let catalog = SqliteCatalog::open(&path).unwrap();
    assert_eq!(catalog.list_backups(TEST_DB_ID).unwrap().len(), 1);
    assert_eq!(
        catalog.get_backup(full.id).unwrap().unwrap().storage_key,
        full.storage_key
    );
}
