use rusqlite::{Connection, params};
use tracing::info;

use crate::error::Result;

pub struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub up: &'static str,
}

pub fn migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "backups, restores and restore tests",
            up: r#"
                CREATE TABLE IF NOT EXISTS backups (
                    id TEXT PRIMARY KEY,
                    database_id TEXT NOT NULL,
                    database_name TEXT NOT NULL,
                    engine TEXT NOT NULL,
                    backup_type TEXT NOT NULL,
                    storage_key TEXT NOT NULL,
                    size_bytes INTEGER NOT NULL DEFAULT 0,
                    checksum TEXT,
                    compression_applied INTEGER NOT NULL DEFAULT 0,
                    encryption_applied INTEGER NOT NULL DEFAULT 0,
                    engine_metadata TEXT NOT NULL DEFAULT '{}',
                    replication_status TEXT NOT NULL DEFAULT '{}',
                    status TEXT NOT NULL,
                    failure_reason TEXT,
                    created_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_backups_database
                    ON backups(database_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_backups_status ON backups(status);

                CREATE TABLE IF NOT EXISTS restores (
                    id TEXT PRIMARY KEY,
                    backup_id TEXT NOT NULL REFERENCES backups(id) ON DELETE CASCADE,
                    database_id TEXT NOT NULL,
                    point_in_time TEXT,
                    verify_only INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    failure_reason TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT
                );
                CREATE INDEX IF NOT EXISTS idx_restores_status ON restores(status);

                CREATE TABLE IF NOT EXISTS restore_tests (
                    id TEXT PRIMARY KEY,
                    backup_id TEXT NOT NULL REFERENCES backups(id) ON DELETE CASCADE,
                    passed INTEGER NOT NULL,
                    checks TEXT NOT NULL DEFAULT '{}',
                    tested_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_restore_tests_backup
                    ON restore_tests(backup_id, tested_at);
            "#,
        },
        Migration {
            version: 2,
            description: "per-database run locks",
            up: r#"
                CREATE TABLE IF NOT EXISTS run_locks (
                    database_id TEXT PRIMARY KEY,
                    token TEXT NOT NULL,
                    purpose TEXT NOT NULL,
                    hostname TEXT NOT NULL,
                    pid INTEGER NOT NULL,
                    acquired_at TEXT NOT NULL
                );
            "#,
        },
    ]
}

pub fn current_version(conn: &Connection) -> Result<u32> {
    Ok(conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?)
}

/// Apply every migration newer than the recorded schema version, each in its
/// own transaction.
pub fn migrate(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
        )",
        [],
    )?;

    let current = current_version(conn)?;
    for migration in migrations() {
        if migration.version <= current {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.up)?;
        tx.execute(
            "INSERT INTO schema_migrations (version, description) VALUES (?1, ?2)",
            params![migration.version, migration.description],
        )?;
        tx.commit()?;
        info!(
            version = migration.version,
            description = migration.description,
            "applied catalog migration"
        );
    }
    Ok(())
}
