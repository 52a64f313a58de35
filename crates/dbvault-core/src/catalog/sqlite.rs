use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use uuid::Uuid;

use super::Catalog;
use super::migrations::migrate;
use crate::error::{Result, VaultError};
use crate::model::{
    BackupRecord, BackupType, EngineKind, RestoreRecord, RestoreTestResult, RunLock, RunStatus,
};

const BACKUP_COLUMNS: &str = "id, database_id, database_name, engine, backup_type, storage_key, \
     size_bytes, checksum, compression_applied, encryption_applied, engine_metadata, \
     replication_status, status, failure_reason, created_at, completed_at";

const LOCK_COLUMNS: &str = "database_id, token, purpose, hostname, pid, acquired_at";

const RESTORE_COLUMNS: &str = "id, backup_id, database_id, point_in_time, verify_only, status, \
     failure_reason, started_at, completed_at";

/// SQLite-backed catalog. One connection guarded by a mutex; statements are
/// short and every write is a single statement or transaction.
pub struct SqliteCatalog {
    conn: Mutex<Connection>,
}

impl SqliteCatalog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| VaultError::Other("catalog connection mutex poisoned".into()))
    }
}

fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(t: Option<DateTime<Utc>>) -> Option<String> {
    t.map(ts)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VaultError::InvalidFormat(format!("bad timestamp '{raw}' in catalog: {e}")))
}

fn parse_opt_ts(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_ts).transpose()
}

fn parse_uuid(raw: &str) -> Result<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|e| VaultError::InvalidFormat(format!("bad id '{raw}' in catalog: {e}")))
}

/// Raw column values, converted outside the rusqlite row callback so
/// conversion failures surface as `VaultError`s.
struct BackupRow {
    id: String,
    database_id: String,
    database_name: String,
    engine: String,
    backup_type: String,
    storage_key: String,
    size_bytes: i64,
    checksum: Option<String>,
    compression_applied: bool,
    encryption_applied: bool,
    engine_metadata: String,
    replication_status: String,
    status: String,
    failure_reason: Option<String>,
    created_at: String,
    completed_at: Option<String>,
}

impl BackupRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            database_id: row.get(1)?,
            database_name: row.get(2)?,
            engine: row.get(3)?,
            backup_type: row.get(4)?,
            storage_key: row.get(5)?,
            size_bytes: row.get(6)?,
            checksum: row.get(7)?,
            compression_applied: row.get(8)?,
            encryption_applied: row.get(9)?,
            engine_metadata: row.get(10)?,
            replication_status: row.get(11)?,
            status: row.get(12)?,
            failure_reason: row.get(13)?,
            created_at: row.get(14)?,
            completed_at: row.get(15)?,
        })
    }

    fn into_record(self) -> Result<BackupRecord> {
        Ok(BackupRecord {
            id: parse_uuid(&self.id)?,
            database_id: parse_uuid(&self.database_id)?,
            database_name: self.database_name,
            engine: EngineKind::parse(&self.engine)?,
            backup_type: BackupType::parse(&self.backup_type)?,
            storage_key: self.storage_key,
            size_bytes: u64::try_from(self.size_bytes).unwrap_or(0),
            checksum: self.checksum,
            compression_applied: self.compression_applied,
            encryption_applied: self.encryption_applied,
            engine_metadata: serde_json::from_str(&self.engine_metadata)?,
            replication_status: serde_json::from_str(&self.replication_status)?,
            status: RunStatus::parse(&self.status)?,
            failure_reason: self.failure_reason,
            created_at: parse_ts(&self.created_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct RestoreRow {
    id: String,
    backup_id: String,
    database_id: String,
    point_in_time: Option<String>,
    verify_only: bool,
    status: String,
    failure_reason: Option<String>,
    started_at: String,
    completed_at: Option<String>,
}

impl RestoreRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            backup_id: row.get(1)?,
            database_id: row.get(2)?,
            point_in_time: row.get(3)?,
            verify_only: row.get(4)?,
            status: row.get(5)?,
            failure_reason: row.get(6)?,
            started_at: row.get(7)?,
            completed_at: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<RestoreRecord> {
        Ok(RestoreRecord {
            id: parse_uuid(&self.id)?,
            backup_id: parse_uuid(&self.backup_id)?,
            database_id: parse_uuid(&self.database_id)?,
            point_in_time: parse_opt_ts(self.point_in_time)?,
            verify_only: self.verify_only,
            status: RunStatus::parse(&self.status)?,
            failure_reason: self.failure_reason,
            started_at: parse_ts(&self.started_at)?,
            completed_at: parse_opt_ts(self.completed_at)?,
        })
    }
}

struct TestRow {
    id: String,
    backup_id: String,
    passed: bool,
    checks: String,
    tested_at: String,
}

impl TestRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            backup_id: row.get(1)?,
            passed: row.get(2)?,
            checks: row.get(3)?,
            tested_at: row.get(4)?,
        })
    }

    fn into_result(self) -> Result<RestoreTestResult> {
        Ok(RestoreTestResult {
            id: parse_uuid(&self.id)?,
            backup_id: parse_uuid(&self.backup_id)?,
            passed: self.passed,
            checks: serde_json::from_str(&self.checks)?,
            tested_at: parse_ts(&self.tested_at)?,
        })
    }
}

struct LockRow {
    database_id: String,
    token: String,
    purpose: String,
    hostname: String,
    pid: u32,
    acquired_at: String,
}

impl LockRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            database_id: row.get(0)?,
            token: row.get(1)?,
            purpose: row.get(2)?,
            hostname: row.get(3)?,
            pid: row.get(4)?,
            acquired_at: row.get(5)?,
        })
    }

    fn into_lock(self) -> Result<RunLock> {
        Ok(RunLock {
            database_id: parse_uuid(&self.database_id)?,
            token: parse_uuid(&self.token)?,
            purpose: self.purpose,
            hostname: self.hostname,
            pid: self.pid,
            acquired_at: parse_ts(&self.acquired_at)?,
        })
    }
}

fn select_lock(conn: &Connection, database_id: Uuid) -> Result<Option<RunLock>> {
    let row = conn
        .query_row(
            &format!("SELECT {LOCK_COLUMNS} FROM run_locks WHERE database_id = ?1"),
            params![database_id.to_string()],
            LockRow::from_row,
        )
        .optional()?;
    row.map(LockRow::into_lock).transpose()
}

impl SqliteCatalog {
    fn query_backups(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<BackupRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, BackupRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(BackupRow::into_record).collect()
    }

    fn query_restores(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RestoreRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RestoreRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RestoreRow::into_record).collect()
    }

    fn query_tests(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RestoreTestResult>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, TestRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(TestRow::into_result).collect()
    }
}

impl Catalog for SqliteCatalog {
    fn insert_backup(&self, r: &BackupRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO backups ({BACKUP_COLUMNS}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
            ),
            params![
                r.id.to_string(),
                r.database_id.to_string(),
                r.database_name,
                r.engine.as_str(),
                r.backup_type.as_str(),
                r.storage_key,
                i64::try_from(r.size_bytes).unwrap_or(i64::MAX),
                r.checksum,
                r.compression_applied,
                r.encryption_applied,
                serde_json::to_string(&r.engine_metadata)?,
                serde_json::to_string(&r.replication_status)?,
                r.status.as_str(),
                r.failure_reason,
                ts(r.created_at),
                opt_ts(r.completed_at),
            ],
        )?;
        Ok(())
    }

    fn update_backup(&self, r: &BackupRecord) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE backups SET storage_key = ?2, size_bytes = ?3, checksum = ?4, \
             compression_applied = ?5, encryption_applied = ?6, engine_metadata = ?7, \
             replication_status = ?8, status = ?9, failure_reason = ?10, completed_at = ?11 \
             WHERE id = ?1",
            params![
                r.id.to_string(),
                r.storage_key,
                i64::try_from(r.size_bytes).unwrap_or(i64::MAX),
                r.checksum,
                r.compression_applied,
                r.encryption_applied,
                serde_json::to_string(&r.engine_metadata)?,
                serde_json::to_string(&r.replication_status)?,
                r.status.as_str(),
                r.failure_reason,
                opt_ts(r.completed_at),
            ],
        )?;
        if changed == 0 {
            return Err(VaultError::BackupNotFound(r.id.to_string()));
        }
        Ok(())
    }

    fn get_backup(&self, id: Uuid) -> Result<Option<BackupRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {BACKUP_COLUMNS} FROM backups WHERE id = ?1"),
                params![id.to_string()],
                BackupRow::from_row,
            )
            .optional()?;
        row.map(BackupRow::into_record).transpose()
    }

    fn list_backups(&self, database_id: Uuid) -> Result<Vec<BackupRecord>> {
        self.query_backups(
            &format!(
                "SELECT {BACKUP_COLUMNS} FROM backups WHERE database_id = ?1 \
                 ORDER BY created_at, id"
            ),
            params![database_id.to_string()],
        )
    }

    fn list_all_backups(&self) -> Result<Vec<BackupRecord>> {
        self.query_backups(
            &format!("SELECT {BACKUP_COLUMNS} FROM backups ORDER BY created_at, id"),
            [],
        )
    }

    fn list_backups_by_status(&self, status: RunStatus) -> Result<Vec<BackupRecord>> {
        self.query_backups(
            &format!(
                "SELECT {BACKUP_COLUMNS} FROM backups WHERE status = ?1 ORDER BY created_at, id"
            ),
            params![status.as_str()],
        )
    }

    fn delete_backup(&self, id: Uuid) -> Result<()> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let id = id.to_string();
        tx.execute("DELETE FROM restore_tests WHERE backup_id = ?1", params![id])?;
        tx.execute("DELETE FROM restores WHERE backup_id = ?1", params![id])?;
        tx.execute("DELETE FROM backups WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }

    fn insert_restore(&self, r: &RestoreRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO restores ({RESTORE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                r.id.to_string(),
                r.backup_id.to_string(),
                r.database_id.to_string(),
                opt_ts(r.point_in_time),
                r.verify_only,
                r.status.as_str(),
                r.failure_reason,
                ts(r.started_at),
                opt_ts(r.completed_at),
            ],
        )?;
        Ok(())
    }

    fn update_restore(&self, r: &RestoreRecord) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE restores SET status = ?2, failure_reason = ?3, completed_at = ?4 \
             WHERE id = ?1 AND status = 'in_progress'",
            params![
                r.id.to_string(),
                r.status.as_str(),
                r.failure_reason,
                opt_ts(r.completed_at),
            ],
        )?;
        Ok(())
    }

    fn get_restore(&self, id: Uuid) -> Result<Option<RestoreRecord>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {RESTORE_COLUMNS} FROM restores WHERE id = ?1"),
                params![id.to_string()],
                RestoreRow::from_row,
            )
            .optional()?;
        row.map(RestoreRow::into_record).transpose()
    }

    fn list_restores_by_status(&self, status: RunStatus) -> Result<Vec<RestoreRecord>> {
        self.query_restores(
            &format!(
                "SELECT {RESTORE_COLUMNS} FROM restores WHERE status = ?1 ORDER BY started_at, id"
            ),
            params![status.as_str()],
        )
    }

    fn insert_test_result(&self, r: &RestoreTestResult) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO restore_tests (id, backup_id, passed, checks, tested_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                r.id.to_string(),
                r.backup_id.to_string(),
                r.passed,
                serde_json::to_string(&r.checks)?,
                ts(r.tested_at),
            ],
        )?;
        Ok(())
    }

    fn latest_test_result(&self, backup_id: Uuid) -> Result<Option<RestoreTestResult>> {
        let mut results = self.query_tests(
            "SELECT id, backup_id, passed, checks, tested_at FROM restore_tests \
             WHERE backup_id = ?1 ORDER BY tested_at DESC LIMIT 1",
            params![backup_id.to_string()],
        )?;
        Ok(results.pop())
    }

    fn list_test_results(&self, backup_id: Uuid) -> Result<Vec<RestoreTestResult>> {
        self.query_tests(
            "SELECT id, backup_id, passed, checks, tested_at FROM restore_tests \
             WHERE backup_id = ?1 ORDER BY tested_at",
            params![backup_id.to_string()],
        )
    }

    fn acquire_run_lock(
        &self,
        lock: &RunLock,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<RunLock>> {
        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;
        let database_id = lock.database_id.to_string();
        tx.execute(
            "DELETE FROM run_locks WHERE database_id = ?1 AND acquired_at < ?2",
            params![database_id, ts(stale_before)],
        )?;
        let inserted = tx.execute(
            &format!(
                "INSERT INTO run_locks ({LOCK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
                 ON CONFLICT(database_id) DO NOTHING"
            ),
            params![
                database_id,
                lock.token.to_string(),
                lock.purpose,
                lock.hostname,
                lock.pid,
                ts(lock.acquired_at),
            ],
        )?;
        let holder = if inserted == 0 {
            select_lock(&tx, lock.database_id)?
        } else {
            None
        };
        tx.commit()?;
        Ok(holder)
    }

    fn release_run_lock(&self, database_id: Uuid, token: Uuid) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM run_locks WHERE database_id = ?1 AND token = ?2",
            params![database_id.to_string(), token.to_string()],
        )?;
        Ok(())
    }

    fn run_lock(&self, database_id: Uuid) -> Result<Option<RunLock>> {
        let conn = self.conn()?;
        select_lock(&conn, database_id)
    }
}
