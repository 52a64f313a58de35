use crate::app::Vault;
use crate::catalog::find_backup_by_prefix;
use crate::chain;
use crate::error::Result;
use crate::model::{BackupRecord, RestoreTestResult};

/// Backup records, oldest first, optionally of one configured database.
pub fn list_backups(vault: &Vault, database: Option<&str>) -> Result<Vec<BackupRecord>> {
    match database {
        Some(name) => {
            let db = vault.config.database(name)?;
            vault.catalog.list_backups(db.id)
        }
        None => vault.catalog.list_all_backups(),
    }
}

#[derive(Debug, Clone)]
pub struct BackupDetail {
    pub record: BackupRecord,
    /// Artifacts a plain restore of this record applies, full first. Empty
    /// when the record cannot be restored.
    pub chain: Vec<BackupRecord>,
    pub tests: Vec<RestoreTestResult>,
}

/// One record by id or unique id prefix, with its restore chain and test history.
pub fn show_backup(vault: &Vault, id_or_prefix: &str) -> Result<BackupDetail> {
    let record = find_backup_by_prefix(vault.catalog.as_ref(), id_or_prefix)?;
    let chain = if record.is_completed() {
        let adapter = vault.adapter(record.engine)?;
        let records = vault.catalog.list_backups(record.database_id)?;
        chain::resolve_chain(&records, &record, None, adapter.as_ref())
            .map(|steps| steps.into_iter().map(|s| s.record).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };
    let tests = vault.catalog.list_test_results(record.id)?;
    Ok(BackupDetail {
        record,
        chain,
        tests,
    })
}
