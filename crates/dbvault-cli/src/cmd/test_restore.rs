use dbvault_core::app::Vault;
use dbvault_core::cancel::CancelToken;
use dbvault_core::catalog::find_backup_by_prefix;
use dbvault_core::commands::restore_test;
use dbvault_core::config::RestoreTestMode;
use dbvault_core::model::RestoreTestResult;

pub(crate) fn run_test_restore(
    vault: &Vault,
    backup: Option<&str>,
    verify_only: bool,
    cancel: &CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let results = match backup {
        Some(id) => {
            let record = find_backup_by_prefix(vault.catalog.as_ref(), id)?;
            let mode = if verify_only {
                RestoreTestMode::VerifyOnly
            } else {
                vault.config.restore_test.mode
            };
            vec![restore_test::test_backup(vault, &record, mode, cancel)?]
        }
        None => restore_test::run_sweep(vault, cancel)?,
    };

    if results.is_empty() {
        println!("No backups due for a restore test.");
        return Ok(());
    }
    for result in &results {
        print_result(result);
    }
    let failed = results.iter().filter(|r| !r.passed).count();
    if failed > 0 {
        return Err(format!("{failed} of {} restore tests failed", results.len()).into());
    }
    Ok(())
}

fn print_result(result: &RestoreTestResult) {
    let verdict = if result.passed { "passed" } else { "FAILED" };
    println!(
        "Backup {}: {verdict}",
        &result.backup_id.simple().to_string()[..8]
    );
    for (name, check) in &result.checks {
        let mark = if check.passed { "ok" } else { "fail" };
        println!("  {name:<13} {mark:<4} {}", check.detail);
    }
}
