//! Long-running mode: fires the scheduled jobs on worker threads until the
//! shutdown token is cancelled.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use super::Vault;
use super::scheduler::{self, Job, ScheduledJob};
use crate::cancel::CancelToken;
use crate::commands::backup::{BackupOptions, run_backup};
use crate::commands::{prune, restore_test, watchdog};
use crate::error::{Result, VaultError};

const TICK: Duration = Duration::from_secs(1);

/// Run until `shutdown` fires, then wait for in-flight jobs to wind down.
///
/// A job never overlaps with itself; a job that is still running when it
/// comes due again is skipped for that round.
pub fn run_daemon(vault: Arc<Vault>, shutdown: &CancelToken) -> Result<()> {
    let mut jobs = scheduler::plan(&vault.config, Instant::now())?;
    info!(jobs = jobs.len(), "daemon started");
    for job in &jobs {
        debug!(job = %job.job, interval_secs = job.interval.as_secs(), "scheduled");
    }

    let running: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
    let mut workers: Vec<JoinHandle<()>> = Vec::new();

    while !shutdown.is_cancelled() {
        let now = Instant::now();
        for scheduled in jobs.iter_mut().filter(|j| j.is_due(now)) {
            scheduled.next_due =
                scheduler::next_run_in(scheduled.interval, vault.config.schedule.jitter_seconds, now);
            let name = scheduled.job.to_string();
            if !mark_running(&running, &name) {
                warn!(job = %name, "previous run still active, skipping");
                continue;
            }
            match spawn_job(&vault, scheduled, &running, shutdown) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!(job = %name, error = %e, "could not start worker");
                    clear_running(&running, &name);
                }
            }
        }
        workers.retain(|w| !w.is_finished());
        std::thread::sleep(TICK);
    }

    info!(in_flight = workers.len(), "shutting down, waiting for running jobs");
    for worker in workers {
        if worker.join().is_err() {
            error!("worker thread panicked");
        }
    }
    info!("daemon stopped");
    Ok(())
}

fn mark_running(running: &Mutex<HashSet<String>>, name: &str) -> bool {
    running
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .insert(name.to_string())
}

fn clear_running(running: &Mutex<HashSet<String>>, name: &str) {
    running
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .remove(name);
}

fn spawn_job(
    vault: &Arc<Vault>,
    scheduled: &ScheduledJob,
    running: &Arc<Mutex<HashSet<String>>>,
    shutdown: &CancelToken,
) -> std::io::Result<JoinHandle<()>> {
    let vault = Arc::clone(vault);
    let running = Arc::clone(running);
    let cancel = shutdown.clone();
    let job = scheduled.job.clone();
    let name = job.to_string();
    std::thread::Builder::new()
        .name(format!("dbvault-{name}"))
        .spawn(move || {
            match run_job(&vault, &job, &cancel) {
                Ok(()) => debug!(job = %name, "job finished"),
                Err(VaultError::Cancelled) => info!(job = %name, "job cancelled"),
                Err(e) if e.is_transient() => warn!(job = %name, error = %e, "job failed"),
                Err(e) => error!(job = %name, error = %e, "job failed"),
            }
            clear_running(&running, &name);
        })
}

/// Execute one job synchronously.
pub fn run_job(vault: &Vault, job: &Job, cancel: &CancelToken) -> Result<()> {
    match job {
        Job::Backup {
            database,
            backup_type,
        } => {
            let db = vault.config.database(database)?;
            let handle = db.handle()?;
            let opts = BackupOptions::for_database(vault, db);
            run_backup(vault, &handle, *backup_type, &opts, cancel).map(|_| ())
        }
        Job::Retention => prune::run(vault, false, false, &[], cancel).map(|_| ()),
        Job::RestoreTest => restore_test::run_sweep(vault, cancel).map(|_| ()),
        Job::Watchdog => watchdog::reconcile(vault).map(|_| ()),
    }
}
