use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Result, VaultError};

/// Current time at the precision the catalog stores.
pub fn timestamp_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    RowStore,
    WalEngine,
    DocumentStore,
    KvStore,
}

impl EngineKind {
    pub const ALL: [EngineKind; 4] = [
        EngineKind::RowStore,
        EngineKind::WalEngine,
        EngineKind::DocumentStore,
        EngineKind::KvStore,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::RowStore => "row_store",
            EngineKind::WalEngine => "wal_engine",
            EngineKind::DocumentStore => "document_store",
            EngineKind::KvStore => "kv_store",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "row_store" => Ok(EngineKind::RowStore),
            "wal_engine" => Ok(EngineKind::WalEngine),
            "document_store" => Ok(EngineKind::DocumentStore),
            "kv_store" => Ok(EngineKind::KvStore),
            other => Err(VaultError::InvalidFormat(format!(
                "unknown engine kind '{other}'"
            ))),
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection details for one logical database. Immutable for the duration
/// of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHandle {
    pub id: Uuid,
    pub engine: EngineKind,
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
    pub database: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupType {
    Full,
    Incremental,
}

impl BackupType {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupType::Full => "full",
            BackupType::Incremental => "incremental",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(BackupType::Full),
            "incremental" => Ok(BackupType::Incremental),
            other => Err(VaultError::InvalidFormat(format!(
                "unknown backup type '{other}'"
            ))),
        }
    }
}

impl fmt::Display for BackupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status shared by backup and restore records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    InProgress,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::InProgress => "in_progress",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(RunStatus::InProgress),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(VaultError::InvalidFormat(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum ReplicationState {
    Pending,
    Completed,
    Failed(String),
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicationState::Pending => f.write_str("pending"),
            ReplicationState::Completed => f.write_str("completed"),
            ReplicationState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

/// Opaque replay position. Only the adapter for `engine` can order two markers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplayMarker {
    pub engine: EngineKind,
    pub token: String,
}

impl ReplayMarker {
    pub fn new(engine: EngineKind, token: impl Into<String>) -> Self {
        Self {
            engine,
            token: token.into(),
        }
    }
}

impl fmt::Display for ReplayMarker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.engine, self.token)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineMetadata {
    pub pitr_capable: bool,
    /// End marker: the first position not contained in this artifact.
    pub marker: Option<ReplayMarker>,
    /// Incrementals only: the parent's end marker.
    pub since_marker: Option<ReplayMarker>,
    pub parent_backup_id: Option<Uuid>,
    /// Instant the end marker corresponds to.
    pub captured_at: Option<DateTime<Utc>>,
    pub first_entry_at: Option<DateTime<Utc>>,
    pub last_entry_at: Option<DateTime<Utc>>,
    pub entry_count: Option<u64>,
    pub object_count: Option<u64>,
    pub compression: Option<String>,
    pub encryption_key_id: Option<String>,
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: Uuid,
    pub database_id: Uuid,
    pub database_name: String,
    pub engine: EngineKind,
    pub backup_type: BackupType,
    pub storage_key: String,
    pub size_bytes: u64,
    /// Digest over the stored bytes, after compression and encryption.
    pub checksum: Option<String>,
    pub compression_applied: bool,
    pub encryption_applied: bool,
    pub engine_metadata: EngineMetadata,
    pub replication_status: BTreeMap<String, ReplicationState>,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BackupRecord {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Instant this record's content reaches, used to order records of a lineage.
    pub fn covered_until(&self) -> Option<DateTime<Utc>> {
        self.engine_metadata
            .captured_at
            .or(self.engine_metadata.last_entry_at)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreRecord {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub database_id: Uuid,
    pub point_in_time: Option<DateTime<Utc>>,
    pub verify_only: bool,
    pub status: RunStatus,
    pub failure_reason: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub passed: bool,
    pub detail: String,
}

impl CheckOutcome {
    pub fn pass(detail: impl Into<String>) -> Self {
        Self {
            passed: true,
            detail: detail.into(),
        }
    }

    pub fn fail(detail: impl Into<String>) -> Self {
        Self {
            passed: false,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreTestResult {
    pub id: Uuid,
    pub backup_id: Uuid,
    pub passed: bool,
    pub checks: BTreeMap<String, CheckOutcome>,
    pub tested_at: DateTime<Utc>,
}

/// Cross-process claim on one database, stored in the catalog while a run
/// is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLock {
    pub database_id: Uuid,
    /// Only the claim with this token may release the row.
    pub token: Uuid,
    pub purpose: String,
    pub hostname: String,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

impl fmt::Display for RunLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} (pid {}) since {}",
            self.purpose,
            self.hostname,
            self.pid,
            self.acquired_at.to_rfc3339()
        )
    }
}
