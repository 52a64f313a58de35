use dbvault_core::app::Vault;

use crate::cli::Commands;
use crate::cmd;
use crate::signal;

/// Run one subcommand that needs an opened vault.
pub(crate) fn dispatch_command(
    command: Commands,
    vault: Vault,
) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = signal::cancel_token();
    match command {
        Commands::Backup {
            database,
            backup_type,
            no_compress,
            no_encrypt,
            no_replicate,
        } => cmd::backup::run_backup(
            &vault,
            &cmd::backup::BackupArgs {
                database: &database,
                backup_type: backup_type.into(),
                no_compress,
                no_encrypt,
                no_replicate,
            },
            &cancel,
        ),
        Commands::Restore {
            backup,
            target,
            point_in_time,
            verify_only,
        } => cmd::restore::run_restore(
            &vault,
            &backup,
            target.as_deref(),
            point_in_time.as_deref(),
            verify_only,
            &cancel,
        ),
        Commands::List { database, last } => cmd::list::run_list(&vault, database.as_deref(), last),
        Commands::Show { backup } => cmd::show::run_show(&vault, &backup),
        Commands::Prune {
            dry_run,
            list,
            database,
        } => cmd::prune::run_prune(&vault, dry_run, list, &database, &cancel),
        Commands::TestRestore {
            backup,
            verify_only,
        } => cmd::test_restore::run_test_restore(&vault, backup.as_deref(), verify_only, &cancel),
        Commands::Watchdog => cmd::watchdog::run_watchdog(&vault),
        Commands::Daemon => cmd::daemon::run_daemon(vault),
        Commands::Keygen { .. } | Commands::Config { .. } => {
            Err("command does not use a configuration file".into())
        }
    }
}
