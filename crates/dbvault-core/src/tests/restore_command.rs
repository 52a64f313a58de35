use chrono::{DateTime, Duration, Utc};

use crate::cancel::CancelToken;
use crate::commands::backup::{BackupOptions, run_backup};
use crate::commands::restore::{RestoreRequest, run_restore};
use crate::error::VaultError;
use crate::model::{BackupRecord, BackupType, DatabaseHandle, RunStatus};
use crate::notify::EventKind;
use crate::storage::StorageBackend;
use crate::testutil::{TEST_DB_ID, TestVault, test_vault};

fn backup(tv: &TestVault, backup_type: BackupType) -> BackupRecord {
    let db = tv.vault.config.database("orders").unwrap();
    let opts = BackupOptions::for_database(&tv.vault, db);
    run_backup(&tv.vault, &tv.handle(), backup_type, &opts, &CancelToken::new()).unwrap()
}

fn request<'a>(
    backup: &BackupRecord,
    target: Option<&'a DatabaseHandle>,
    point_in_time: Option<DateTime<Utc>>,
) -> RestoreRequest<'a> {
    RestoreRequest {
        backup_id: backup.id,
        target,
        point_in_time,
        verify_only: false,
    }
}

/// Full with r1, then an incremental with r2..r4 ten seconds apart.
fn full_then_incremental(tv: &TestVault, t0: DateTime<Utc>) -> (BackupRecord, BackupRecord) {
    tv.engine.commit("r1", t0);
    let full = backup(tv, BackupType::Full);
    for (i, row) in ["r2", "r3", "r4"].iter().enumerate() {
        tv.engine.commit(row, t0 + Duration::seconds(10 * (i as i64 + 1)));
    }
    let inc = backup(tv, BackupType::Incremental);
    (full, inc)
}

#[test]
fn corrupted_artifact_fails_before_anything_is_applied() {
    let tv = test_vault();
    let (_, inc) = full_then_incremental(&tv, Utc::now() - Duration::hours(1));
    tv.primary.corrupt(&inc.storage_key);

    let target = tv.target();
    let err = run_restore(&tv.vault, &request(&inc, Some(&target), None), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, VaultError::IntegrityViolation { ref key, .. } if key == &inc.storage_key));

    let calls = tv.engine.calls();
    assert!(!calls.iter().any(|c| c.starts_with("apply")), "{calls:?}");
    assert!(tv.engine.target_rows(target.id).is_empty());

    let failed = tv
        .vault
        .catalog
        .list_restores_by_status(RunStatus::Failed)
        .unwrap();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].failure_reason.as_deref().unwrap().starts_with("integrity_violation"));

    let kinds = tv.notifier.kinds();
    assert!(kinds.contains(&EventKind::IntegrityViolation));
    assert_eq!(kinds.last(), Some(&EventKind::RestoreFailed));
}

#[test]
fn point_in_time_restore_stops_at_target() {
    let tv = test_vault();
    let t0 = Utc::now() - Duration::hours(1);
    let (_, inc) = full_then_incremental(&tv, t0);

    let target = tv.target();
    let pit = t0 + Duration::seconds(15);
    let outcome = run_restore(&tv.vault, &request(&inc, Some(&target), Some(pit)), &CancelToken::new())
        .unwrap();

    assert_eq!(tv.engine.target_rows(target.id), vec!["r1", "r2"]);
    assert_eq!(outcome.replay.applied, 1);
    assert_eq!(outcome.replay.skipped, 2);
    assert_eq!(outcome.chain.len(), 2);
    assert_eq!(outcome.chain[1].up_to, Some(pit));
    assert_eq!(outcome.record.status, RunStatus::Completed);
    assert_eq!(outcome.record.point_in_time, Some(pit));
}

#[test]
fn point_in_time_before_full_is_not_covered() {
    let tv = test_vault();
    let t0 = Utc::now() - Duration::hours(1);
    let (full, _) = full_then_incremental(&tv, t0);
    let target = tv.target();
    let err = run_restore(
        &tv.vault,
        &request(&full, Some(&target), Some(t0 - Duration::seconds(1))),
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, VaultError::NoCoverage(_)), "{err}");
    assert!(tv.engine.calls().iter().all(|c| c == "dump"));
}

#[test]
fn verify_only_never_calls_the_adapter() {
    let tv = test_vault();
    let (_, inc) = full_then_incremental(&tv, Utc::now() - Duration::hours(1));
    let calls_before = tv.engine.calls();

    let outcome = run_restore(
        &tv.vault,
        &RestoreRequest {
            backup_id: inc.id,
            target: None,
            point_in_time: None,
            verify_only: true,
        },
        &CancelToken::new(),
    )
    .unwrap();
    assert!(outcome.record.verify_only);
    assert_eq!(outcome.chain.len(), 2);
    assert_eq!(tv.engine.calls(), calls_before);
}

#[test]
fn restore_is_recorded_under_its_target_database() {
    let tv = test_vault();
    tv.engine.commit("r1", Utc::now());
    let full = backup(&tv, BackupType::Full);
    let target = tv.target();

    let outcome =
        run_restore(&tv.vault, &request(&full, Some(&target), None), &CancelToken::new()).unwrap();
    assert_eq!(outcome.record.database_id, target.id);
    assert_ne!(outcome.record.database_id, full.database_id);
    let stored = tv.vault.catalog.get_restore(outcome.record.id).unwrap().unwrap();
    assert_eq!(stored.database_id, target.id);
    assert_eq!(stored.status, RunStatus::Completed);

    let verified = run_restore(
        &tv.vault,
        &RestoreRequest {
            verify_only: true,
            ..request(&full, None, None)
        },
        &CancelToken::new(),
    )
    .unwrap();
    assert_eq!(verified.record.database_id, TEST_DB_ID);
}

#[test]
fn restore_requires_target_unless_verifying() {
    let tv = test_vault();
    tv.engine.commit("r1", Utc::now());
    let full = backup(&tv, BackupType::Full);
    let err = run_restore(&tv.vault, &request(&full, None, None), &CancelToken::new()).unwrap_err();
    assert!(matches!(err, VaultError::Config(_)));
}

#[test]
fn missing_primary_object_is_read_from_replica() {
    let tv = test_vault();
    tv.engine.commit("r1", Utc::now());
    let full = backup(&tv, BackupType::Full);
    tv.primary.delete(&full.storage_key).unwrap();

    let target = tv.target();
    run_restore(&tv.vault, &request(&full, Some(&target), None), &CancelToken::new()).unwrap();
    assert_eq!(tv.engine.target_rows(target.id), vec!["r1"]);
}

#[test]
fn unknown_backup_is_reported() {
    let tv = test_vault();
    let err = run_restore(
        &tv.vault,
        &RestoreRequest {
            backup_id: uuid::Uuid::new_v4(),
            target: None,
            point_in_time: None,
            verify_only: true,
        },
        &CancelToken::new(),
    )
    .unwrap_err();
    assert!(matches!(err, VaultError::BackupNotFound(_)));
}

#[test]
fn restore_of_full_uses_rotated_key() {
    let mut tv = test_vault();
    tv.engine.commit("r1", Utc::now());
    let full = backup(&tv, BackupType::Full);

    // Rotate: a new current key, the old one kept for reading.
    tv.vault.keyring = Some(
        crate::pipeline::keyring::KeyRing::new(
            "k2",
            vec![("k1".into(), [0x11; 32]), ("k2".into(), [0x22; 32])],
        )
        .unwrap(),
    );
    let target = tv.target();
    run_restore(&tv.vault, &request(&full, Some(&target), None), &CancelToken::new()).unwrap();
    assert_eq!(tv.engine.target_rows(target.id), vec!["r1"]);

    tv.vault.keyring = Some(
        crate::pipeline::keyring::KeyRing::new("k2", vec![("k2".into(), [0x22; 32])]).unwrap(),
    );
    let other = tv.target();
    let err = run_restore(&tv.vault, &request(&full, Some(&other), None), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, VaultError::UnknownKey(ref id) if id == "k1"), "{err}");
}
