use comfy_table::Cell;

use dbvault_core::app::Vault;
use dbvault_core::commands::list;

use crate::format::{format_bytes, format_time};
use crate::table::CliTableTheme;

pub(crate) fn run_list(
    vault: &Vault,
    database: Option<&str>,
    last: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut records = list::list_backups(vault, database)?;

    if let Some(n) = last {
        let len = records.len();
        if n < len {
            records.drain(..len - n);
        }
    }
    if records.is_empty() {
        println!("No backups found.");
        return Ok(());
    }

    let theme = CliTableTheme::detect();
    let mut table =
        theme.new_data_table(&["ID", "Database", "Engine", "Type", "Status", "Size", "Created"]);
    for r in &records {
        table.add_row(vec![
            Cell::new(r.short_id()),
            Cell::new(&r.database_name),
            Cell::new(r.engine),
            Cell::new(r.backup_type),
            theme.status_cell(r.status),
            Cell::new(format_bytes(r.size_bytes)),
            Cell::new(format_time(r.created_at)),
        ]);
    }
    println!("{table}");
    Ok(())
}
