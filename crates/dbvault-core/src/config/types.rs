use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::defaults::*;
use super::deserialize::*;
use crate::error::{Result, VaultError};
use crate::model::{Credentials, DatabaseHandle, EngineKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VaultConfig {
    /// Scratch directory for dumps and transformed artifacts.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
    #[serde(default)]
    pub catalog: CatalogConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub encryption: EncryptionConfig,
    #[serde(default)]
    pub engines: EnginesConfig,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub restore_test: RestoreTestConfig,
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub hooks: HooksConfig,
}

impl VaultConfig {
    pub fn database(&self, name: &str) -> Result<&DatabaseConfig> {
        self.databases
            .iter()
            .find(|db| db.name == name)
            .ok_or_else(|| VaultError::Config(format!("no database named '{name}' configured")))
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let mut names = std::collections::HashSet::new();
        let mut ids = std::collections::HashSet::new();
        for db in &self.databases {
            if !names.insert(db.name.as_str()) {
                return Err(VaultError::Config(format!(
                    "duplicate database name '{}'",
                    db.name
                )));
            }
            if !ids.insert(db.id) {
                return Err(VaultError::Config(format!(
                    "duplicate database id '{}'",
                    db.id
                )));
            }
            for region in &db.replicate_to {
                if !self.storage.replicas.iter().any(|r| &r.region == region) {
                    return Err(VaultError::Config(format!(
                        "database '{}' replicates to unknown region '{region}'",
                        db.name
                    )));
                }
            }
        }
        if self.encryption.enabled {
            let current = self.encryption.current_key.as_deref().ok_or_else(|| {
                VaultError::Config("encryption.enabled requires encryption.current_key".into())
            })?;
            if !self.encryption.keys.iter().any(|k| k.id == current) {
                return Err(VaultError::Config(format!(
                    "encryption.current_key '{current}' is not listed in encryption.keys"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_path")]
    pub path: PathBuf,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            path: default_catalog_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

/// One object-storage location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Bare path, `file://` or `s3://bucket/prefix`.
    pub url: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// S3 endpoint (`https://host[:port]`); defaults to AWS for the region.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub region: String,
    pub url: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_algorithm")]
    pub algorithm: CompressionAlgorithm,
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
            zstd_level: default_zstd_level(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Lz4,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
            CompressionAlgorithm::Zstd => "zstd",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EncryptionConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Key id used for new artifacts; older ids stay readable.
    #[serde(default)]
    pub current_key: Option<String>,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

/// A 256-bit key given either inline as hex or through an environment variable.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub id: String,
    #[serde(default)]
    pub key_hex: Option<String>,
    #[serde(default)]
    pub key_env: Option<String>,
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfig")
            .field("id", &self.id)
            .field("key_hex", &self.key_hex.as_ref().map(|_| "***"))
            .field("key_env", &self.key_env)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(
        default = "default_engine_timeout",
        deserialize_with = "deserialize_duration_string"
    )]
    pub timeout: String,
    /// Overrides for native tool paths, keyed by tool name (e.g. `mysqldump`).
    #[serde(default)]
    pub binaries: HashMap<String, String>,
    /// Shell template used to load a full artifact, for engines without a
    /// native loader. `{artifact}`, `{host}` and `{port}` are substituted.
    #[serde(default)]
    pub restore_command: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            timeout: default_engine_timeout(),
            binaries: HashMap::new(),
            restore_command: None,
        }
    }
}

impl EngineSettings {
    pub fn timeout_duration(&self) -> Result<Duration> {
        parse_human_duration(&self.timeout)
    }

    pub fn binary(&self, tool: &str) -> String {
        self.binaries
            .get(tool)
            .cloned()
            .unwrap_or_else(|| tool.to_string())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnginesConfig {
    #[serde(default)]
    pub row_store: EngineSettings,
    #[serde(default)]
    pub wal_engine: EngineSettings,
    #[serde(default)]
    pub document_store: EngineSettings,
    #[serde(default)]
    pub kv_store: EngineSettings,
}

impl EnginesConfig {
    pub fn settings(&self, kind: EngineKind) -> &EngineSettings {
        match kind {
            EngineKind::RowStore => &self.row_store,
            EngineKind::WalEngine => &self.wal_engine,
            EngineKind::DocumentStore => &self.document_store,
            EngineKind::KvStore => &self.kv_store,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub id: Uuid,
    pub engine: EngineKind,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: String,
    /// Environment variable holding the password. Never store it inline.
    #[serde(default)]
    pub password_env: Option<String>,
    /// Logical database name; defaults to `name`.
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub schedule: DatabaseSchedule,
    #[serde(default)]
    pub replicate_to: Vec<String>,
}

impl DatabaseConfig {
    pub fn handle(&self) -> Result<DatabaseHandle> {
        let password = match &self.password_env {
            Some(var) => std::env::var(var).map_err(|_| {
                VaultError::Config(format!(
                    "database '{}': environment variable '{var}' is not set",
                    self.name
                ))
            })?,
            None => String::new(),
        };
        Ok(DatabaseHandle {
            id: self.id,
            engine: self.engine,
            host: self.host.clone(),
            port: self.port,
            credentials: Credentials {
                username: self.username.clone(),
                password,
            },
            database: self.database.clone().unwrap_or_else(|| self.name.clone()),
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseSchedule {
    #[serde(default, deserialize_with = "deserialize_optional_duration_string")]
    pub full_every: Option<String>,
    #[serde(default, deserialize_with = "deserialize_optional_duration_string")]
    pub incremental_every: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Keep every full younger than this (e.g. "2d", "1w").
    #[serde(default, deserialize_with = "deserialize_optional_duration_string")]
    pub keep_within: Option<String>,
    pub keep_last: Option<usize>,
    pub keep_daily: Option<usize>,
    pub keep_weekly: Option<usize>,
    pub keep_monthly: Option<usize>,
    pub keep_yearly: Option<usize>,
    /// Incrementals younger than this are kept regardless of their full.
    #[serde(default, deserialize_with = "deserialize_optional_duration_string")]
    pub keep_incrementals_within: Option<String>,
    /// Failed records older than this are purged.
    #[serde(
        default = "default_purge_failed_after",
        deserialize_with = "deserialize_optional_duration_string"
    )]
    pub purge_failed_after: Option<String>,
}

impl RetentionConfig {
    pub fn has_any_rule(&self) -> bool {
        self.keep_within.is_some()
            || self.keep_last.is_some()
            || self.keep_daily.is_some()
            || self.keep_weekly.is_some()
            || self.keep_monthly.is_some()
            || self.keep_yearly.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreTestMode {
    Full,
    VerifyOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreTestConfig {
    #[serde(default)]
    pub enabled: bool,
    /// How often the sweep runs.
    #[serde(
        default = "default_restore_test_every",
        deserialize_with = "deserialize_duration_string"
    )]
    pub every: String,
    /// A backup is due again once its newest result is older than this.
    #[serde(
        default = "default_test_interval",
        deserialize_with = "deserialize_duration_string"
    )]
    pub test_interval: String,
    #[serde(default = "default_max_per_sweep")]
    pub max_per_sweep: usize,
    #[serde(default = "default_restore_test_mode")]
    pub mode: RestoreTestMode,
    #[serde(default = "default_docker_binary")]
    pub docker: String,
    /// Sandbox image per engine kind; unset kinds use built-in images.
    #[serde(default)]
    pub images: BTreeMap<EngineKind, String>,
}

impl Default for RestoreTestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every: default_restore_test_every(),
            test_interval: default_test_interval(),
            max_per_sweep: default_max_per_sweep(),
            mode: default_restore_test_mode(),
            docker: default_docker_binary(),
            images: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchdogConfig {
    #[serde(
        default = "default_watchdog_every",
        deserialize_with = "deserialize_duration_string"
    )]
    pub every: String,
    /// In-progress records older than this are failed.
    #[serde(
        default = "default_max_run_duration",
        deserialize_with = "deserialize_duration_string"
    )]
    pub max_run_duration: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            every: default_watchdog_every(),
            max_run_duration: default_max_run_duration(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub jitter_seconds: u64,
    #[serde(
        default = "default_retention_every",
        deserialize_with = "deserialize_duration_string"
    )]
    pub retention_every: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            jitter_seconds: 0,
            retention_every: default_retention_every(),
        }
    }
}

/// Shell commands per event name (`backup_completed`, `any`, ...).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HooksConfig {
    pub hooks: HashMap<String, Vec<String>>,
}

impl HooksConfig {
    pub fn get_hooks(&self, key: &str) -> &[String] {
        self.hooks.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.values().all(Vec::is_empty)
    }
}
