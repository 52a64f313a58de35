use std::sync::Arc;

use dbvault_core::app::{Vault, daemon, scheduler};

use crate::signal;

pub(crate) fn run_daemon(vault: Vault) -> Result<(), Box<dyn std::error::Error>> {
    let jobs = scheduler::plan(&vault.config, std::time::Instant::now())?;
    if jobs.len() <= 1 {
        return Err(
            "nothing to schedule: set databases[].schedule, retention or restore_test in your config"
                .into(),
        );
    }

    tracing::info!(
        databases = vault.config.databases.len(),
        jitter_seconds = vault.config.schedule.jitter_seconds,
        "daemon starting"
    );
    let shutdown = signal::cancel_token();
    daemon::run_daemon(Arc::new(vault), &shutdown)?;
    Ok(())
}
