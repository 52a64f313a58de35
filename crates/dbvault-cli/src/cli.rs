use clap::{Parser, Subcommand, ValueEnum};

use dbvault_core::model::BackupType;

#[derive(Parser)]
#[command(
    name = "dbvault",
    version,
    about = "Database backups with point-in-time restore and restore verification",
    after_help = "\
Configuration file lookup order:
  1. --config <path>             (explicit flag)
  2. $DBVAULT_CONFIG             (environment variable)
  3. ./dbvault.yaml              (project)
  4. /etc/dbvault/config.yaml    (system)

Environment variables:
  DBVAULT_CONFIG    Path to configuration file (overrides default search)"
)]
pub(crate) struct Cli {
    /// Path to configuration file (overrides DBVAULT_CONFIG and default search)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub(crate) enum BackupKind {
    Full,
    Incremental,
}

impl From<BackupKind> for BackupType {
    fn from(kind: BackupKind) -> Self {
        match kind {
            BackupKind::Full => BackupType::Full,
            BackupKind::Incremental => BackupType::Incremental,
        }
    }
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Take a backup of one configured database
    Backup {
        /// Database name as configured
        #[arg(short, long)]
        database: String,

        /// Backup type
        #[arg(short = 't', long = "type", value_enum, default_value_t = BackupKind::Full)]
        backup_type: BackupKind,

        /// Store the artifact without compression
        #[arg(long)]
        no_compress: bool,

        /// Store the artifact without encryption
        #[arg(long)]
        no_encrypt: bool,

        /// Skip copying to the database's replica regions
        #[arg(long)]
        no_replicate: bool,
    },

    /// Restore a backup chain into a configured database
    Restore {
        /// Backup id or unique id prefix
        backup: String,

        /// Configured database to restore into
        #[arg(long, required_unless_present = "verify_only")]
        target: Option<String>,

        /// Stop replay at this instant (RFC 3339, or a span ago such as 30m, 2h, 1d)
        #[arg(long = "at")]
        point_in_time: Option<String>,

        /// Fetch and verify every artifact of the chain without applying it
        #[arg(long)]
        verify_only: bool,
    },

    /// List backup records
    List {
        /// Only records of this database
        #[arg(short, long)]
        database: Option<String>,

        /// Show only the N most recent records
        #[arg(long)]
        last: Option<usize>,
    },

    /// Show one backup record with its restore chain and test history
    Show {
        /// Backup id or unique id prefix
        backup: String,
    },

    /// Apply the retention policy
    Prune {
        /// Only show what would be pruned, don't actually prune
        #[arg(short = 'n', long)]
        dry_run: bool,

        /// Show detailed list of kept/pruned records with reasons
        #[arg(long)]
        list: bool,

        /// Apply retention only to these databases
        #[arg(short, long)]
        database: Vec<String>,
    },

    /// Restore backups into throwaway sandboxes and check them
    TestRestore {
        /// Test this backup instead of the due ones
        backup: Option<String>,

        /// Only verify artifact integrity, no sandbox
        #[arg(long)]
        verify_only: bool,
    },

    /// Fail runs stuck in progress and remove their temporary objects
    Watchdog,

    /// Run scheduled jobs as a foreground daemon
    Daemon,

    /// Generate a new encryption key
    Keygen {
        /// Key id to print alongside the key
        #[arg(long, default_value = "k1")]
        id: String,
    },

    /// Generate a minimal configuration file
    Config {
        /// Destination path
        #[arg(short, long, default_value = "dbvault.yaml")]
        dest: String,
    },
}

impl Commands {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Backup { .. } => "backup",
            Self::Restore { .. } => "restore",
            Self::List { .. } => "list",
            Self::Show { .. } => "show",
            Self::Prune { .. } => "prune",
            Self::TestRestore { .. } => "test-restore",
            Self::Watchdog => "watchdog",
            Self::Daemon => "daemon",
            Self::Keygen { .. } => "keygen",
            Self::Config { .. } => "config",
        }
    }
}
