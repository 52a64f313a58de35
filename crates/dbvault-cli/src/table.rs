use std::io::IsTerminal;

use comfy_table::{Attribute, Cell, Color, Table, presets::NOTHING};

use dbvault_core::model::RunStatus;

/// Styling for list and show output. Plain text when piped or `NO_COLOR` is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct CliTableTheme {
    pub use_color: bool,
}

impl CliTableTheme {
    pub(crate) fn detect() -> Self {
        Self {
            use_color: std::io::stdout().is_terminal()
                && std::env::var_os("NO_COLOR").is_none(),
        }
    }

    fn table(self) -> Table {
        let mut table = Table::new();
        table.load_preset(NOTHING);
        table
    }

    pub(crate) fn new_data_table(self, headers: &[&str]) -> Table {
        let mut table = self.table();
        table.set_header(headers.iter().map(|h| self.label(h)).collect::<Vec<_>>());
        table
    }

    pub(crate) fn new_kv_table(self) -> Table {
        self.table()
    }

    fn label(self, text: &str) -> Cell {
        let cell = Cell::new(text);
        if self.use_color {
            cell.add_attribute(Attribute::Bold)
        } else {
            cell
        }
    }

    /// Failed runs in red, runs still going in yellow.
    pub(crate) fn status_cell(self, status: RunStatus) -> Cell {
        let cell = Cell::new(status);
        if !self.use_color {
            return cell;
        }
        match status {
            RunStatus::Completed => cell,
            RunStatus::InProgress => cell.fg(Color::Yellow),
            RunStatus::Failed => cell.fg(Color::Red),
        }
    }
}

pub(crate) fn add_kv_row(
    table: &mut Table,
    theme: CliTableTheme,
    field: &str,
    value: impl ToString,
) {
    table.add_row(vec![theme.label(field), Cell::new(value.to_string())]);
}
