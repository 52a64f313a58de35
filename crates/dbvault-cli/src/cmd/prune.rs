use dbvault_core::app::Vault;
use dbvault_core::cancel::CancelToken;
use dbvault_core::commands::prune;

use crate::format::{format_bytes, format_time};

pub(crate) fn run_prune(
    vault: &Vault,
    dry_run: bool,
    list: bool,
    databases: &[String],
    cancel: &CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let (stats, list_entries) = prune::run(vault, dry_run, list, databases, cancel)?;

    if list || dry_run {
        for entry in &list_entries {
            let name = format!(
                "{} {} {:<11} {}",
                entry.database,
                &entry.backup_id.simple().to_string()[..8],
                entry.backup_type,
                format_time(entry.created_at)
            );
            if entry.reasons.is_empty() {
                println!("{:<6} {name}", entry.action);
            } else {
                println!("{:<6} {name}  [{}]", entry.action, entry.reasons.join(", "));
            }
        }
        println!();
    }

    for db in &stats.skipped_databases {
        eprintln!("Warning: skipped database '{db}' (busy or policy refused)");
    }
    if dry_run {
        println!(
            "Dry run: would keep {} and prune {} backups",
            stats.kept, stats.pruned,
        );
    } else {
        println!(
            "Pruned {} backups (kept {}), freed {}",
            stats.pruned,
            stats.kept,
            format_bytes(stats.bytes_freed),
        );
    }
    if stats.failed > 0 {
        return Err(format!("{} backups could not be removed from storage", stats.failed).into());
    }
    Ok(())
}
