use dbvault_core::app::Vault;
use dbvault_core::commands::list;

use crate::format::{format_bytes, format_time};
use crate::table::{CliTableTheme, add_kv_row};

pub(crate) fn run_show(vault: &Vault, backup: &str) -> Result<(), Box<dyn std::error::Error>> {
    let detail = list::show_backup(vault, backup)?;
    let r = &detail.record;
    let meta = &r.engine_metadata;

    let theme = CliTableTheme::detect();
    let mut table = theme.new_kv_table();
    add_kv_row(&mut table, theme, "ID", r.id);
    add_kv_row(&mut table, theme, "Database", &r.database_name);
    add_kv_row(&mut table, theme, "Engine", r.engine);
    add_kv_row(&mut table, theme, "Type", r.backup_type);
    add_kv_row(&mut table, theme, "Status", r.status);
    if let Some(reason) = &r.failure_reason {
        add_kv_row(&mut table, theme, "Failure", reason);
    }
    add_kv_row(&mut table, theme, "Created", format_time(r.created_at));
    if let Some(done) = r.completed_at {
        add_kv_row(&mut table, theme, "Completed", format_time(done));
    }
    add_kv_row(&mut table, theme, "Storage key", &r.storage_key);
    add_kv_row(&mut table, theme, "Size", format_bytes(r.size_bytes));
    add_kv_row(&mut table, theme, "Checksum", r.checksum.as_deref().unwrap_or("-"));
    add_kv_row(
        &mut table,
        theme,
        "Compression",
        meta.compression.as_deref().unwrap_or("none"),
    );
    add_kv_row(
        &mut table,
        theme,
        "Encryption key",
        meta.encryption_key_id.as_deref().unwrap_or("none"),
    );
    add_kv_row(&mut table, theme, "Point-in-time capable", meta.pitr_capable);
    if let Some(marker) = &meta.marker {
        add_kv_row(&mut table, theme, "End marker", marker);
    }
    if let (Some(first), Some(last)) = (meta.first_entry_at, meta.last_entry_at) {
        add_kv_row(
            &mut table,
            theme,
            "Entries",
            format!(
                "{} from {} to {}",
                meta.entry_count.unwrap_or(0),
                format_time(first),
                format_time(last)
            ),
        );
    }
    for (region, state) in &r.replication_status {
        add_kv_row(&mut table, theme, &format!("Replica {region}"), state);
    }
    println!("{table}");

    if !detail.chain.is_empty() {
        println!();
        println!("Restore chain:");
        for step in &detail.chain {
            println!(
                "  {} {} {}",
                step.short_id(),
                step.backup_type,
                format_time(step.created_at)
            );
        }
    }
    if !detail.tests.is_empty() {
        println!();
        println!("Restore tests:");
        for test in &detail.tests {
            let verdict = if test.passed { "passed" } else { "FAILED" };
            println!("  {} {verdict}", format_time(test.tested_at));
            for (name, check) in &test.checks {
                let mark = if check.passed { "ok" } else { "fail" };
                println!("    {name:<13} {mark:<4} {}", check.detail);
            }
        }
    }
    Ok(())
}
