use dbvault_core::app::Vault;
use dbvault_core::cancel::CancelToken;
use dbvault_core::commands::backup::{self, BackupOptions};
use dbvault_core::model::{BackupType, ReplicationState};

use crate::format::format_bytes;

pub(crate) struct BackupArgs<'a> {
    pub database: &'a str,
    pub backup_type: BackupType,
    pub no_compress: bool,
    pub no_encrypt: bool,
    pub no_replicate: bool,
}

pub(crate) fn run_backup(
    vault: &Vault,
    args: &BackupArgs<'_>,
    cancel: &CancelToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let db = vault.config.database(args.database)?;
    let handle = db.handle()?;

    let mut opts = BackupOptions::for_database(vault, db);
    opts.compress &= !args.no_compress;
    opts.encrypt &= !args.no_encrypt;
    if args.no_replicate {
        opts.replicate_to.clear();
    }

    let record = backup::run_backup(vault, &handle, args.backup_type, &opts, cancel)?;

    println!(
        "Backup {} ({}) of '{}' completed: {}",
        record.short_id(),
        record.backup_type,
        record.database_name,
        format_bytes(record.size_bytes),
    );
    if let Some(marker) = &record.engine_metadata.marker {
        println!("  end marker: {marker}");
    }
    for (region, state) in &record.replication_status {
        match state {
            ReplicationState::Failed(reason) => {
                eprintln!("Warning: replication to '{region}' failed: {reason}");
            }
            other => println!("  replica {region}: {other}"),
        }
    }
    Ok(())
}
