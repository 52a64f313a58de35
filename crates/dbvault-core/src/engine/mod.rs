//! Engine adapters: everything engine-specific about producing and applying
//! dumps and replay segments lives behind [`EngineAdapter`].

pub mod document_store;
pub mod kv_store;
pub mod replay_log;
pub mod row_store;
pub mod wal_engine;

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::cancel::CancelToken;
use crate::config::{EngineSettings, EnginesConfig};
use crate::error::{Result, VaultError};
use crate::model::{BackupType, DatabaseHandle, EngineKind, EngineMetadata, ReplayMarker};

pub use self::document_store::DocumentStoreAdapter;
pub use self::kv_store::KvStoreAdapter;
pub use self::row_store::RowStoreAdapter;
pub use self::wal_engine::WalEngineAdapter;

/// Bounds for one adapter call.
#[derive(Clone, Copy)]
pub struct ExecContext<'a> {
    pub cancel: &'a CancelToken,
    pub timeout: Duration,
}

pub struct DumpRequest<'a> {
    pub handle: &'a DatabaseHandle,
    pub backup_type: BackupType,
    /// Parent end marker; present exactly for incrementals.
    pub since: Option<&'a ReplayMarker>,
    pub output: &'a Path,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: u64,
    /// Entries past the target that were left out.
    pub skipped: u64,
    pub last_applied_at: Option<DateTime<Utc>>,
}

pub trait EngineAdapter: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn pitr_capable(&self) -> bool;

    /// Write a full dump or an incremental replay segment to `req.output`.
    ///
    /// A full captures its end marker atomically with (or strictly before)
    /// the snapshot. An incremental contains exactly the entries after
    /// `req.since` up to the returned end marker.
    fn dump(&self, req: &DumpRequest<'_>, ctx: &ExecContext<'_>) -> Result<EngineMetadata>;

    /// Current replay position of the live engine, `None` when the engine
    /// has no replay log.
    fn read_marker(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<Option<ReplayMarker>>;

    /// Load a full dump into `handle`. Not idempotent.
    fn apply_dump(
        &self,
        handle: &DatabaseHandle,
        artifact: &Path,
        metadata: &EngineMetadata,
        ctx: &ExecContext<'_>,
    ) -> Result<()>;

    /// Apply a replay segment in order, stopping after the last entry
    /// committed at or before `target`. `None` applies the whole segment.
    fn apply_replay_up_to(
        &self,
        handle: &DatabaseHandle,
        replay: &Path,
        target: Option<DateTime<Utc>>,
        ctx: &ExecContext<'_>,
    ) -> Result<ReplayStats>;

    fn compare_markers(&self, a: &ReplayMarker, b: &ReplayMarker) -> Result<Ordering>;

    fn ping(&self, handle: &DatabaseHandle, ctx: &ExecContext<'_>) -> Result<()>;

    /// Number of user tables/collections/keys, when the engine can tell.
    fn count_objects(&self, handle: &DatabaseHandle, ctx: &ExecContext<'_>)
    -> Result<Option<u64>>;
}

/// One adapter per engine kind plus the per-kind call timeout.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<EngineKind, Arc<dyn EngineAdapter>>,
    timeouts: HashMap<EngineKind, Duration>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adapters driving the native tools, configured from `engines`.
    pub fn native(engines: &EnginesConfig) -> Result<Self> {
        let registry = Self::new()
            .with(
                Arc::new(RowStoreAdapter::new(engines.row_store.clone())),
                engines.row_store.timeout_duration()?,
            )
            .with(
                Arc::new(WalEngineAdapter::new(engines.wal_engine.clone())),
                engines.wal_engine.timeout_duration()?,
            )
            .with(
                Arc::new(DocumentStoreAdapter::new(engines.document_store.clone())),
                engines.document_store.timeout_duration()?,
            )
            .with(
                Arc::new(KvStoreAdapter::new(engines.kv_store.clone())),
                engines.kv_store.timeout_duration()?,
            );
        Ok(registry)
    }

    pub fn with(mut self, adapter: Arc<dyn EngineAdapter>, timeout: Duration) -> Self {
        let kind = adapter.kind();
        self.adapters.insert(kind, adapter);
        self.timeouts.insert(kind, timeout);
        self
    }

    pub fn adapter_for(&self, kind: EngineKind) -> Result<Arc<dyn EngineAdapter>> {
        self.adapters.get(&kind).cloned().ok_or_else(|| {
            VaultError::UnsupportedOperation(format!("no adapter registered for {kind}"))
        })
    }

    pub fn timeout_for(&self, kind: EngineKind) -> Duration {
        self.timeouts
            .get(&kind)
            .copied()
            .unwrap_or(Duration::from_secs(4 * 3600))
    }
}

/// Reject markers produced by another engine before parsing their token.
pub(crate) fn expect_engine(marker: &ReplayMarker, kind: EngineKind) -> Result<&str> {
    if marker.engine != kind {
        return Err(VaultError::InvalidFormat(format!(
            "{kind} adapter given a {} marker",
            marker.engine
        )));
    }
    Ok(&marker.token)
}

/// Command for a native tool, honoring per-engine binary overrides.
pub(crate) fn tool(settings: &EngineSettings, name: &str) -> Command {
    Command::new(settings.binary(name))
}

/// Single-quoted SQL string literal.
pub(crate) fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Double-quoted SQL identifier.
pub(crate) fn sql_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// First whitespace-trimmed line of tool output parsed as a count.
pub(crate) fn parse_count(tool: &str, output: &str) -> Result<u64> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty());
    line.and_then(|l| l.parse().ok()).ok_or_else(|| {
        VaultError::InvalidFormat(format!(
            "{tool} returned '{}' where a count was expected",
            output.trim()
        ))
    })
}

/// Scratch file next to `anchor`, removed on drop.
pub(crate) fn sibling_temp(anchor: &Path, suffix: &str) -> Result<tempfile::NamedTempFile> {
    let dir = anchor
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(tempfile::Builder::new()
        .prefix(".dbvault-")
        .suffix(suffix)
        .tempfile_in(dir)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_reports_missing_adapter() {
        let registry = AdapterRegistry::new();
        let err = registry.adapter_for(EngineKind::KvStore).err().unwrap();
        assert!(matches!(err, VaultError::UnsupportedOperation(_)));
    }

    #[test]
    fn native_registry_covers_every_engine() {
        let registry = AdapterRegistry::native(&EnginesConfig::default()).unwrap();
        for kind in EngineKind::ALL {
            assert_eq!(registry.adapter_for(kind).unwrap().kind(), kind);
            assert_eq!(registry.timeout_for(kind), Duration::from_secs(4 * 3600));
        }
    }

    #[test]
    fn foreign_markers_are_rejected() {
        let marker = ReplayMarker::new(EngineKind::RowStore, "bin.000001:4");
        assert_eq!(expect_engine(&marker, EngineKind::RowStore).unwrap(), "bin.000001:4");
        assert!(expect_engine(&marker, EngineKind::WalEngine).is_err());
    }

    #[test]
    fn sql_quoting_doubles_delimiters() {
        assert_eq!(sql_literal("o'brien"), "'o''brien'");
        assert_eq!(sql_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn parse_count_skips_blank_lines() {
        assert_eq!(parse_count("t", "\n  42 \n").unwrap(), 42);
        assert!(parse_count("t", "nope").is_err());
    }
}
