use dbvault_core::app::Vault;
use dbvault_core::cancel::CancelToken;
use dbvault_core::catalog::find_backup_by_prefix;
use dbvault_core::commands::restore::{RestoreRequest, run_restore as restore_chain};

use crate::format::{format_time, parse_point_in_time};

pub(crate) fn run_restore(
    vault: &Vault,
    backup: &str,
    target: Option<&str>,
    point_in_time: Option<&str>,
    verify_only: bool,
    cancel: &CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let record = find_backup_by_prefix(vault.catalog.as_ref(), backup)?;
    let point_in_time = point_in_time.map(parse_point_in_time).transpose()?;
    let target = match target {
        Some(name) => Some(vault.config.database(name)?.handle()?),
        None => None,
    };

    let outcome = restore_chain(
        vault,
        &RestoreRequest {
            backup_id: record.id,
            target: target.as_ref(),
            point_in_time,
            verify_only,
        },
        cancel,
    )?;

    if verify_only {
        println!(
            "Verified {} artifacts of backup {}",
            outcome.chain.len(),
            record.short_id()
        );
        return Ok(());
    }

    for step in &outcome.chain {
        match step.up_to {
            Some(at) => println!(
                "  {} {} (up to {})",
                step.record.backup_type,
                step.record.short_id(),
                format_time(at)
            ),
            None => println!("  {} {}", step.record.backup_type, step.record.short_id()),
        }
    }
    println!(
        "Restored {} artifacts into '{}': {} replay entries applied, {} skipped",
        outcome.chain.len(),
        target.as_ref().map_or("-", |t| t.database.as_str()),
        outcome.replay.applied,
        outcome.replay.skipped,
    );
    Ok(())
}
