//! Periodic proof that backups restore: each due record is restored into a
//! throwaway sandbox and checked.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::restore::{RestoreRequest, run_restore};
use crate::app::Vault;
use crate::cancel::CancelToken;
use crate::config::{RestoreTestMode, parse_chrono_duration};
use crate::engine::{EngineAdapter, ExecContext};
use crate::error::{Result, VaultError};
use crate::model::{
    BackupRecord, CheckOutcome, DatabaseHandle, RestoreTestResult, RunStatus, timestamp_now,
};
use crate::notify::{EventKind, RunEvent};
use crate::sandbox::Sandbox;

const READY_TIMEOUT: Duration = Duration::from_secs(180);
const READY_POLL: Duration = Duration::from_secs(2);
const PING_TIMEOUT: Duration = Duration::from_secs(10);

pub const CHECK_PROVISION: &str = "provision";
pub const CHECK_RESTORE: &str = "restore";
pub const CHECK_CONNECTIVITY: &str = "connectivity";
pub const CHECK_OBJECT_COUNT: &str = "object_count";
pub const CHECK_TEARDOWN: &str = "teardown";
pub const CHECK_INTEGRITY: &str = "integrity";

/// Completed records due for a test, oldest first, at most `max_per_sweep`.
pub fn due_backups(vault: &Vault) -> Result<Vec<BackupRecord>> {
    let cfg = &vault.config.restore_test;
    let cutoff = timestamp_now() - parse_chrono_duration(&cfg.test_interval)?;

    let mut candidates = vault.catalog.list_backups_by_status(RunStatus::Completed)?;
    candidates.sort_by_key(|r| r.created_at);

    let mut due = Vec::new();
    for record in candidates {
        if due.len() >= cfg.max_per_sweep {
            break;
        }
        let last = vault.catalog.latest_test_result(record.id)?;
        if last.is_none_or(|t| t.tested_at < cutoff) {
            due.push(record);
        }
    }
    Ok(due)
}

/// Test every due record. A failing test is a result, not an error.
pub fn run_sweep(vault: &Vault, cancel: &CancelToken) -> Result<Vec<RestoreTestResult>> {
    let due = due_backups(vault)?;
    info!(count = due.len(), "restore-test sweep");
    let mut results = Vec::with_capacity(due.len());
    for record in due {
        cancel.check()?;
        results.push(test_backup(vault, &record, vault.config.restore_test.mode, cancel)?);
    }
    Ok(results)
}

/// Restore one record into a fresh sandbox, check it, tear the sandbox down
/// and store the result.
pub fn test_backup(
    vault: &Vault,
    record: &BackupRecord,
    mode: RestoreTestMode,
    cancel: &CancelToken,
) -> Result<RestoreTestResult> {
    info!(backup_id = %record.id, database = %record.database_name, ?mode, "restore test started");
    let checks = match mode {
        RestoreTestMode::VerifyOnly => verify_only_checks(vault, record, cancel),
        RestoreTestMode::Full => sandbox_checks(vault, record, cancel),
    };
    // A cancelled test leaves no verdict behind.
    cancel.check()?;

    let passed = checks.values().all(|c| c.passed);
    let result = RestoreTestResult {
        id: Uuid::new_v4(),
        backup_id: record.id,
        passed,
        checks,
        tested_at: timestamp_now(),
    };
    vault.catalog.insert_test_result(&result)?;

    let kind = if passed {
        EventKind::RestoreTestPassed
    } else {
        EventKind::RestoreTestFailed
    };
    let mut event = RunEvent::new(kind, &record.database_name).backup(record.id);
    if let Some((name, check)) = result.checks.iter().find(|(_, c)| !c.passed) {
        event = event.error(format!("{name}: {}", check.detail));
    }
    vault.notifier.notify(&event);
    info!(backup_id = %record.id, passed, "restore test finished");
    Ok(result)
}

fn verify_only_checks(
    vault: &Vault,
    record: &BackupRecord,
    cancel: &CancelToken,
) -> BTreeMap<String, CheckOutcome> {
    let req = RestoreRequest {
        backup_id: record.id,
        target: None,
        point_in_time: None,
        verify_only: true,
    };
    let outcome = match run_restore(vault, &req, cancel) {
        Ok(out) => CheckOutcome::pass(format!("{} artifacts verified", out.chain.len())),
        Err(e) => CheckOutcome::fail(e.to_string()),
    };
    BTreeMap::from([(CHECK_INTEGRITY.to_string(), outcome)])
}

fn sandbox_checks(
    vault: &Vault,
    record: &BackupRecord,
    cancel: &CancelToken,
) -> BTreeMap<String, CheckOutcome> {
    let mut checks = BTreeMap::new();
    let adapter = match vault.adapter(record.engine) {
        Ok(adapter) => adapter,
        Err(e) => {
            checks.insert(CHECK_PROVISION.to_string(), CheckOutcome::fail(e.to_string()));
            return checks;
        }
    };

    let sandbox = match vault
        .sandbox
        .provision(record.engine, &record.database_name, cancel)
    {
        Ok(sandbox) => sandbox,
        Err(e) => {
            checks.insert(CHECK_PROVISION.to_string(), CheckOutcome::fail(e.to_string()));
            return checks;
        }
    };

    match wait_until_ready(adapter.as_ref(), &sandbox.handle, cancel) {
        Ok(waited) => {
            checks.insert(
                CHECK_PROVISION.to_string(),
                CheckOutcome::pass(format!("ready after {}s", waited.as_secs())),
            );
            run_checks(vault, adapter.as_ref(), record, &sandbox, &mut checks, cancel);
        }
        Err(e) => {
            checks.insert(CHECK_PROVISION.to_string(), CheckOutcome::fail(e.to_string()));
        }
    }

    let teardown = match vault.sandbox.teardown(&sandbox) {
        Ok(()) => CheckOutcome::pass(format!("removed {}", sandbox.id)),
        Err(e) => {
            warn!(sandbox = %sandbox.id, error = %e, "sandbox teardown failed");
            CheckOutcome::fail(e.to_string())
        }
    };
    checks.insert(CHECK_TEARDOWN.to_string(), teardown);
    checks
}

fn run_checks(
    vault: &Vault,
    adapter: &dyn EngineAdapter,
    record: &BackupRecord,
    sandbox: &Sandbox,
    checks: &mut BTreeMap<String, CheckOutcome>,
    cancel: &CancelToken,
) {
    let req = RestoreRequest {
        backup_id: record.id,
        target: Some(&sandbox.handle),
        point_in_time: None,
        verify_only: false,
    };
    match run_restore(vault, &req, cancel) {
        Ok(out) => {
            checks.insert(
                CHECK_RESTORE.to_string(),
                CheckOutcome::pass(format!("applied {} artifacts", out.chain.len())),
            );
        }
        Err(e) => {
            checks.insert(CHECK_RESTORE.to_string(), CheckOutcome::fail(e.to_string()));
            return;
        }
    }

    let ctx = vault.exec_context(record.engine, cancel);
    let connectivity = match adapter.ping(&sandbox.handle, &ctx) {
        Ok(()) => CheckOutcome::pass("reachable"),
        Err(e) => CheckOutcome::fail(e.to_string()),
    };
    checks.insert(CHECK_CONNECTIVITY.to_string(), connectivity);

    if let Some(expected) = record.engine_metadata.object_count {
        let outcome = match adapter.count_objects(&sandbox.handle, &ctx) {
            Ok(Some(actual)) if actual == expected => {
                CheckOutcome::pass(format!("{actual} objects"))
            }
            Ok(Some(actual)) => {
                CheckOutcome::fail(format!("expected {expected} objects, found {actual}"))
            }
            Ok(None) => CheckOutcome::fail("engine cannot count objects"),
            Err(e) => CheckOutcome::fail(e.to_string()),
        };
        checks.insert(CHECK_OBJECT_COUNT.to_string(), outcome);
    }
}

/// Ping the fresh sandbox until it answers.
fn wait_until_ready(
    adapter: &dyn EngineAdapter,
    handle: &DatabaseHandle,
    cancel: &CancelToken,
) -> Result<Duration> {
    let started = Instant::now();
    let ctx = ExecContext {
        cancel,
        timeout: PING_TIMEOUT,
    };
    loop {
        cancel.check()?;
        match adapter.ping(handle, &ctx) {
            Ok(()) => return Ok(started.elapsed()),
            Err(VaultError::Cancelled) => return Err(VaultError::Cancelled),
            Err(e) if started.elapsed() >= READY_TIMEOUT => {
                return Err(VaultError::EngineUnreachable(format!(
                    "sandbox not ready after {}s: {e}",
                    READY_TIMEOUT.as_secs()
                )));
            }
            Err(e) => debug!(error = %e, "sandbox not ready yet"),
        }
        std::thread::sleep(READY_POLL);
    }
}
