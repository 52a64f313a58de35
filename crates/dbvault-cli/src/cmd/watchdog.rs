use dbvault_core::app::Vault;
use dbvault_core::commands::watchdog;

pub(crate) fn run_watchdog(vault: &Vault) -> Result<(), Box<dyn std::error::Error>> {
    let stats = watchdog::reconcile(vault)?;
    println!(
        "Reconciled {} stale backups and {} stale restores",
        stats.backups_failed, stats.restores_failed
    );
    Ok(())
}
