pub mod local_backend;
pub mod retry;
pub mod s3_backend;

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::config::{ReplicaConfig, RetryConfig, StorageConfig};
use crate::error::{Result, VaultError};
use crate::model::{BackupType, EngineKind, ReplicationState};

pub use self::local_backend::LocalBackend;
pub use self::s3_backend::S3Backend;

pub const TEMP_SUFFIX: &str = ".partial";

/// Object storage for one region. Keys are `/`-separated relative paths.
/// Transfers stream from and to local files.
pub trait StorageBackend: Send + Sync {
    fn put_file(&self, key: &str, source: &Path, cancel: &CancelToken) -> Result<()>;

    /// Download `key` into `dest`. Returns `false` when the key does not exist.
    fn get_to_file(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<bool>;

    /// Delete a key. Missing keys are not an error.
    fn delete(&self, key: &str) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Move `from` to `to`, replacing `to`.
    fn rename(&self, from: &str, to: &str) -> Result<()>;
}

/// Reader that fails with `Cancelled` once the token fires.
pub struct CancelReader<'a, R> {
    inner: R,
    cancel: &'a CancelToken,
}

impl<'a, R: Read> CancelReader<'a, R> {
    pub fn new(inner: R, cancel: &'a CancelToken) -> Self {
        Self { inner, cancel }
    }
}

impl<R: Read> Read for CancelReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.cancel.check().map_err(VaultError::into_io)?;
        self.inner.read(buf)
    }
}

/// Storage key of a backup artifact; sorts chronologically within a database.
pub fn artifact_key(
    engine: EngineKind,
    database_name: &str,
    created_at: DateTime<Utc>,
    backup_type: BackupType,
    id: Uuid,
) -> String {
    let short = &id.simple().to_string()[..8];
    format!(
        "{engine}/{}/{}-{backup_type}-{short}.dump",
        sanitize_segment(database_name),
        created_at.format("%Y%m%dT%H%M%SZ"),
    )
}

pub fn temp_key(final_key: &str) -> String {
    format!("{final_key}{TEMP_SUFFIX}")
}

fn sanitize_segment(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Build a backend from a storage URL: bare path, `file://` or `s3://bucket/prefix`.
pub fn backend_from_url(
    url: &str,
    region: &str,
    endpoint: Option<&str>,
    access_key_id: Option<&str>,
    secret_access_key: Option<&str>,
    retry: &RetryConfig,
) -> Result<Arc<dyn StorageBackend>> {
    if let Some(rest) = url.strip_prefix("s3://") {
        let (bucket, root) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(VaultError::Config(format!("S3 URL '{url}' has no bucket")));
        }
        let default_endpoint = format!("https://s3.{region}.amazonaws.com");
        let endpoint = endpoint.unwrap_or(&default_endpoint);
        let access_key_id = access_key_id
            .ok_or_else(|| VaultError::Config(format!("{url}: access_key_id is required")))?;
        let secret_access_key = secret_access_key
            .ok_or_else(|| VaultError::Config(format!("{url}: secret_access_key is required")))?;
        let backend = S3Backend::new(
            bucket,
            region,
            root,
            endpoint,
            access_key_id,
            secret_access_key,
            retry.clone(),
        )?;
        return Ok(Arc::new(backend));
    }

    let path = url.strip_prefix("file://").unwrap_or(url);
    if path.contains("://") {
        return Err(VaultError::Config(format!(
            "unsupported storage URL scheme: '{url}'"
        )));
    }
    Ok(Arc::new(LocalBackend::new(path)?))
}

/// The primary artifact location plus replica regions.
#[derive(Clone)]
pub struct ObjectStore {
    primary: String,
    backends: BTreeMap<String, Arc<dyn StorageBackend>>,
}

impl ObjectStore {
    pub fn new(primary_region: &str, primary: Arc<dyn StorageBackend>) -> Self {
        let mut backends = BTreeMap::new();
        backends.insert(primary_region.to_string(), primary);
        Self {
            primary: primary_region.to_string(),
            backends,
        }
    }

    pub fn with_region(mut self, region: &str, backend: Arc<dyn StorageBackend>) -> Self {
        self.backends.insert(region.to_string(), backend);
        self
    }

    pub fn from_config(cfg: &StorageConfig) -> Result<Self> {
        let primary = backend_from_url(
            &cfg.url,
            &cfg.region,
            cfg.endpoint.as_deref(),
            cfg.access_key_id.as_deref(),
            cfg.secret_access_key.as_deref(),
            &cfg.retry,
        )?;
        let mut store = Self::new(&cfg.region, primary);
        for ReplicaConfig {
            region,
            url,
            endpoint,
            access_key_id,
            secret_access_key,
        } in &cfg.replicas
        {
            if region == &cfg.region {
                return Err(VaultError::Config(format!(
                    "replica region '{region}' duplicates the primary region"
                )));
            }
            let backend = backend_from_url(
                url,
                region,
                endpoint.as_deref(),
                access_key_id.as_deref(),
                secret_access_key.as_deref(),
                &cfg.retry,
            )?;
            store = store.with_region(region, backend);
        }
        Ok(store)
    }

    pub fn primary_region(&self) -> &str {
        &self.primary
    }

    pub fn regions(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    fn backend(&self, region: &str) -> Result<&Arc<dyn StorageBackend>> {
        self.backends
            .get(region)
            .ok_or_else(|| VaultError::Config(format!("unknown storage region '{region}'")))
    }

    /// Upload to the primary region under `key` directly.
    pub fn upload(&self, key: &str, source: &Path, cancel: &CancelToken) -> Result<()> {
        self.backend(&self.primary)?.put_file(key, source, cancel)
    }

    /// Make a fully written temporary object visible under its final key.
    pub fn promote(&self, temp_key: &str, final_key: &str) -> Result<()> {
        self.backend(&self.primary)?.rename(temp_key, final_key)
    }

    /// Upload under the temporary key, then promote. The temporary object is
    /// removed eagerly when either step fails.
    pub fn upload_staged(&self, key: &str, source: &Path, cancel: &CancelToken) -> Result<()> {
        let temp = temp_key(key);
        let result = self
            .upload(&temp, source, cancel)
            .and_then(|()| self.promote(&temp, key));
        if let Err(ref e) = result {
            warn!(key, error = %e, "staged upload failed, removing temporary object");
            if let Err(cleanup) = self.delete(&temp, &self.primary) {
                warn!(key = %temp, error = %cleanup, "failed to remove temporary object");
            }
        }
        result
    }

    /// Download from the primary region.
    pub fn download(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<()> {
        self.download_from(&self.primary, key, dest, cancel)
    }

    pub fn download_from(
        &self,
        region: &str,
        key: &str,
        dest: &Path,
        cancel: &CancelToken,
    ) -> Result<()> {
        if self.backend(region)?.get_to_file(key, dest, cancel)? {
            debug!(key, region, "downloaded artifact");
            Ok(())
        } else {
            Err(VaultError::ArtifactMissing(format!("{region}:{key}")))
        }
    }

    /// Best-effort copy of `key` from one region to another. Never touches
    /// the source; failures are reported, not raised.
    pub fn copy(
        &self,
        key: &str,
        source_region: &str,
        dest_region: &str,
        work_dir: &Path,
        cancel: &CancelToken,
    ) -> ReplicationState {
        let result = (|| -> Result<()> {
            let source = self.backend(source_region)?;
            let dest = self.backend(dest_region)?;
            let scratch = tempfile::NamedTempFile::new_in(work_dir)?;
            if !source.get_to_file(key, scratch.path(), cancel)? {
                return Err(VaultError::ArtifactMissing(format!("{source_region}:{key}")));
            }
            let temp = temp_key(key);
            let staged = dest
                .put_file(&temp, scratch.path(), cancel)
                .and_then(|()| dest.rename(&temp, key));
            if staged.is_err() {
                let _ = dest.delete(&temp);
            }
            staged
        })();

        match result {
            Ok(()) => {
                info!(key, from = source_region, to = dest_region, "replicated artifact");
                ReplicationState::Completed
            }
            Err(e) => {
                warn!(key, from = source_region, to = dest_region, error = %e, "replication failed");
                ReplicationState::Failed(e.to_string())
            }
        }
    }

    pub fn delete(&self, key: &str, region: &str) -> Result<()> {
        self.backend(region)?.delete(key)
    }

    pub fn exists(&self, key: &str, region: &str) -> Result<bool> {
        self.backend(region)?.exists(key)
    }

    pub fn list(&self, prefix: &str, region: &str) -> Result<Vec<String>> {
        self.backend(region)?.list(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn artifact_key_layout() {
        let id = Uuid::parse_str("0123abcd-0000-4000-8000-000000000000").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let key = artifact_key(EngineKind::WalEngine, "orders", at, BackupType::Full, id);
        assert_eq!(key, "wal_engine/orders/20240309T140507Z-full-0123abcd.dump");
        assert_eq!(temp_key(&key), format!("{key}.partial"));
    }

    #[test]
    fn artifact_keys_sort_chronologically() {
        let id = Uuid::new_v4();
        let early = Utc.with_ymd_and_hms(2024, 1, 31, 23, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 2, 1, 1, 0, 0).unwrap();
        let a = artifact_key(EngineKind::RowStore, "db", early, BackupType::Incremental, id);
        let b = artifact_key(EngineKind::RowStore, "db", late, BackupType::Full, id);
        assert!(a < b);
    }

    #[test]
    fn database_names_cannot_escape_prefix() {
        let key = artifact_key(
            EngineKind::KvStore,
            "../etc/passwd",
            Utc::now(),
            BackupType::Full,
            Uuid::new_v4(),
        );
        assert!(key.starts_with("kv_store/.._etc_passwd/"));
    }

    #[test]
    fn backend_from_url_rejects_unknown_scheme() {
        let err = backend_from_url("ftp://host/x", "r", None, None, None, &RetryConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::Config(_)));
    }

    #[test]
    fn s3_url_requires_credentials() {
        let err = backend_from_url("s3://bucket/prefix", "eu-west-1", None, None, None, &RetryConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, VaultError::Config(_)));
    }
}
