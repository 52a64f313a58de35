use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::app::Vault;
use crate::cancel::CancelToken;
use crate::catalog::SqliteCatalog;
use crate::config::parse_config;
use crate::engine::replay_log::{ReplayEntry, ReplayHeader, ReplayLogWriter, render_until};
use crate::engine::{
    AdapterRegistry, DumpRequest, EngineAdapter, ExecContext, ReplayStats, expect_engine,
    sibling_temp,
};
use crate::error::{Result, VaultError};
use crate::model::{
    BackupRecord, BackupType, DatabaseHandle, EngineKind, EngineMetadata, ReplayMarker,
    RunStatus,
};
use crate::notify::{EventKind, Notifier, RunEvent};
use crate::sandbox::{Sandbox, SandboxProvisioner};
use crate::storage::{ObjectStore, StorageBackend, artifact_key};

pub const TEST_DB_ID: Uuid = Uuid::from_u128(0x6f1c9a52_8d4b_4e1f_9a7e_2b8c3d4e5f60);
pub const TEST_DB_NAME: &str = "orders";
pub const TEST_KEY_HEX: &str = "1111111111111111111111111111111111111111111111111111111111111111";

/// In-memory storage backend for testing. Thread-safe via Mutex.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
    fail_renames: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        self.data.lock().unwrap().keys().cloned().collect()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.lock().unwrap().get(key).cloned()
    }

    pub fn insert(&self, key: &str, bytes: &[u8]) {
        self.data.lock().unwrap().insert(key.to_string(), bytes.to_vec());
    }

    /// Make every `put_file` fail as if the service were down.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, AtomicOrdering::SeqCst);
    }

    /// Make every `rename` fail as if the service were down.
    pub fn fail_renames(&self, fail: bool) {
        self.fail_renames.store(fail, AtomicOrdering::SeqCst);
    }

    /// Flip one byte in the middle of a stored object.
    pub fn corrupt(&self, key: &str) {
        let mut map = self.data.lock().unwrap();
        let bytes = map.get_mut(key).expect("object to corrupt");
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
    }
}

impl StorageBackend for MemoryBackend {
    fn put_file(&self, key: &str, source: &Path, cancel: &CancelToken) -> Result<()> {
        cancel.check()?;
        if self.fail_puts.load(AtomicOrdering::SeqCst) {
            return UnavailableBackend::down();
        }
        let bytes = std::fs::read(source)?;
        self.data.lock().unwrap().insert(key.to_string(), bytes);
        Ok(())
    }

    fn get_to_file(&self, key: &str, dest: &Path, cancel: &CancelToken) -> Result<bool> {
        cancel.check()?;
        match self.get(key) {
            Some(bytes) => {
                std::fs::write(dest, bytes)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.data.lock().unwrap().remove(key);
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.data.lock().unwrap().contains_key(key))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        if self.fail_renames.load(AtomicOrdering::SeqCst) {
            return UnavailableBackend::down();
        }
        let mut map = self.data.lock().unwrap();
        let bytes = map
            .remove(from)
            .ok_or_else(|| VaultError::ArtifactMissing(from.to_string()))?;
        map.insert(to.to_string(), bytes);
        Ok(())
    }
}

/// Backend whose every call fails as if the service were down.
pub struct UnavailableBackend;

impl UnavailableBackend {
    fn down<T>() -> Result<T> {
        Err(VaultError::StorageUnavailable("503 Service Unavailable".into()))
    }
}

impl StorageBackend for UnavailableBackend {
    fn put_file(&self, _key: &str, _source: &Path, _cancel: &CancelToken) -> Result<()> {
        Self::down()
    }
    fn get_to_file(&self, _key: &str, _dest: &Path, _cancel: &CancelToken) -> Result<bool> {
        Self::down()
    }
    fn delete(&self, _key: &str) -> Result<()> {
        Self::down()
    }
    fn exists(&self, _key: &str) -> Result<bool> {
        Self::down()
    }
    fn list(&self, _prefix: &str) -> Result<Vec<String>> {
        Self::down()
    }
    fn rename(&self, _from: &str, _to: &str) -> Result<()> {
        Self::down()
    }
}

struct FixtureEntry {
    at: DateTime<Utc>,
    payload: String,
}

#[derive(Default)]
struct FixtureState {
    /// Source database replay log; a marker is the number of entries it covers.
    log: Vec<FixtureEntry>,
    /// Rows applied to each restore target, by handle id.
    targets: HashMap<Uuid, Vec<String>>,
    calls: Vec<String>,
    unreachable: bool,
    block_dumps: bool,
    dump_started: bool,
}

/// In-memory engine with a replay log of text rows.
///
/// Full dumps hold every row committed so far; incrementals use the shared
/// replay-log format, so restores exercise the same rendering path as the
/// native adapters.
pub struct FixtureEngine {
    kind: EngineKind,
    state: Mutex<FixtureState>,
}

impl FixtureEngine {
    pub fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            state: Mutex::new(FixtureState::default()),
        }
    }

    /// Commit one row to the source database; returns its end marker.
    pub fn commit(&self, payload: &str, at: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock().unwrap();
        state.log.push(FixtureEntry {
            at,
            payload: payload.to_string(),
        });
        state.log.len() as u64
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn target_rows(&self, handle_id: Uuid) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .targets
            .get(&handle_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Make dumps spin until cancelled. Resets `dump_started`.
    pub fn block_dumps(&self, block: bool) {
        let mut state = self.state.lock().unwrap();
        state.block_dumps = block;
        state.dump_started = false;
    }

    pub fn dump_started(&self) -> bool {
        self.state.lock().unwrap().dump_started
    }

    fn marker(&self, n: u64) -> ReplayMarker {
        ReplayMarker::new(self.kind, n.to_string())
    }

    fn parse_marker(&self, marker: &ReplayMarker) -> Result<u64> {
        expect_engine(marker, self.kind)?
            .parse()
            .map_err(|_| VaultError::InvalidFormat(format!("bad fixture marker {marker}")))
    }

    fn record_call(&self, call: &str) {
        self.state.lock().unwrap().calls.push(call.to_string());
    }
}

impl EngineAdapter for FixtureEngine {
    fn kind(&self) -> EngineKind {
        self.kind
    }

    fn pitr_capable(&self) -> bool {
        true
    }

    fn dump(&self, req: &DumpRequest<'_>, ctx: &ExecContext<'_>) -> Result<EngineMetadata> {
        self.record_call("dump");
        loop {
            let mut state = self.state.lock().unwrap();
            state.dump_started = true;
            if !state.block_dumps {
                break;
            }
            drop(state);
            ctx.cancel.check()?;
            std::thread::sleep(Duration::from_millis(5));
        }
        ctx.cancel.check()?;

        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(VaultError::EngineUnreachable("connection refused".into()));
        }
        let head = state.log.len() as u64;
        match req.since {
            None => {
                let mut out = std::fs::File::create(req.output)?;
                for entry in &state.log {
                    writeln!(out, "{}", entry.payload)?;
                }
                Ok(EngineMetadata {
                    pitr_capable: true,
                    marker: Some(self.marker(head)),
                    captured_at: Some(state.log.last().map_or_else(Utc::now, |e| e.at)),
                    object_count: Some(head),
                    ..Default::default()
                })
            }
            Some(since) => {
                let from = self.parse_marker(since)?;
                let header = ReplayHeader {
                    engine: self.kind,
                    format: "fixture".into(),
                    preamble: String::new(),
                    epilogue: String::new(),
                };
                let mut writer = ReplayLogWriter::create(req.output, &header)?;
                for (i, entry) in state.log.iter().enumerate().skip(from as usize) {
                    writer.append(&ReplayEntry {
                        marker: (i as u64 + 1).to_string(),
                        committed_at: entry.at,
                        payload: entry.payload.clone(),
                    })?;
                }
                let (_, summary) = writer.finish()?;
                Ok(EngineMetadata {
                    pitr_capable: true,
                    marker: Some(self.marker(head)),
                    captured_at: summary.last_entry_at,
                    first_entry_at: summary.first_entry_at,
                    last_entry_at: summary.last_entry_at,
                    entry_count: Some(summary.entry_count),
                    ..Default::default()
                })
            }
        }
    }

    fn read_marker(
        &self,
        _handle: &DatabaseHandle,
        _ctx: &ExecContext<'_>,
    ) -> Result<Option<ReplayMarker>> {
        let head = self.state.lock().unwrap().log.len() as u64;
        Ok(Some(self.marker(head)))
    }

    fn apply_dump(
        &self,
        handle: &DatabaseHandle,
        artifact: &Path,
        _metadata: &EngineMetadata,
        _ctx: &ExecContext<'_>,
    ) -> Result<()> {
        self.record_call("apply_dump");
        let rows = read_lines(artifact)?;
        self.state.lock().unwrap().targets.insert(handle.id, rows);
        Ok(())
    }

    fn apply_replay_up_to(
        &self,
        handle: &DatabaseHandle,
        replay: &Path,
        target: Option<DateTime<Utc>>,
        _ctx: &ExecContext<'_>,
    ) -> Result<ReplayStats> {
        self.record_call("apply_replay");
        let script = sibling_temp(replay, ".rows")?;
        let stats = render_until(replay, target, script.path(), self.kind)?;
        let rows = read_lines(script.path())?;
        self.state
            .lock()
            .unwrap()
            .targets
            .entry(handle.id)
            .or_default()
            .extend(rows);
        Ok(stats)
    }

    fn compare_markers(&self, a: &ReplayMarker, b: &ReplayMarker) -> Result<Ordering> {
        Ok(self.parse_marker(a)?.cmp(&self.parse_marker(b)?))
    }

    fn ping(&self, _handle: &DatabaseHandle, _ctx: &ExecContext<'_>) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            return Err(VaultError::EngineUnreachable("connection refused".into()));
        }
        Ok(())
    }

    fn count_objects(
        &self,
        handle: &DatabaseHandle,
        _ctx: &ExecContext<'_>,
    ) -> Result<Option<u64>> {
        Ok(Some(self.target_rows(handle.id).len() as u64))
    }
}

fn read_lines(path: &Path) -> Result<Vec<String>> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut rows = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if !line.is_empty() {
            rows.push(line);
        }
    }
    Ok(rows)
}

/// Collects every event for assertions.
#[derive(Default)]
pub struct RecordingNotifier {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingNotifier {
    pub fn kinds(&self) -> Vec<EventKind> {
        self.events.lock().unwrap().iter().map(|e| e.kind).collect()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &RunEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

/// Sandbox that hands out fresh handles and counts teardowns.
#[derive(Default)]
pub struct FixtureSandbox {
    pub provisioned: Mutex<Vec<Sandbox>>,
    pub torn_down: Mutex<Vec<String>>,
    pub fail_provision: Mutex<bool>,
    pub fail_teardown: Mutex<bool>,
}

impl SandboxProvisioner for FixtureSandbox {
    fn provision(
        &self,
        engine: EngineKind,
        database: &str,
        _cancel: &CancelToken,
    ) -> Result<Sandbox> {
        if *self.fail_provision.lock().unwrap() {
            return Err(VaultError::Other("no capacity for sandbox".into()));
        }
        let sandbox = Sandbox {
            id: format!("sandbox-{}", self.provisioned.lock().unwrap().len()),
            handle: DatabaseHandle {
                id: Uuid::new_v4(),
                engine,
                host: "127.0.0.1".into(),
                port: 1,
                credentials: Default::default(),
                database: database.to_string(),
            },
        };
        self.provisioned.lock().unwrap().push(sandbox.clone());
        Ok(sandbox)
    }

    fn teardown(&self, sandbox: &Sandbox) -> Result<()> {
        self.torn_down.lock().unwrap().push(sandbox.id.clone());
        if *self.fail_teardown.lock().unwrap() {
            return Err(VaultError::Other("container would not stop".into()));
        }
        Ok(())
    }
}

pub struct TestVault {
    pub vault: Vault,
    pub engine: Arc<FixtureEngine>,
    pub primary: Arc<MemoryBackend>,
    pub replica: Arc<MemoryBackend>,
    pub notifier: Arc<RecordingNotifier>,
    pub sandbox: Arc<FixtureSandbox>,
    pub dir: tempfile::TempDir,
}

impl TestVault {
    pub fn handle(&self) -> DatabaseHandle {
        self.vault
            .config
            .database(TEST_DB_NAME)
            .unwrap()
            .handle()
            .unwrap()
    }

    /// An empty restore target distinct from the source database.
    pub fn target(&self) -> DatabaseHandle {
        DatabaseHandle {
            id: Uuid::new_v4(),
            ..self.handle()
        }
    }
}

pub fn test_vault() -> TestVault {
    test_vault_with("")
}

/// Vault over in-memory storage, catalog and engine. `extra_yaml` adds
/// top-level config sections.
pub fn test_vault_with(extra_yaml: &str) -> TestVault {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().display();
    let yaml = format!(
        r#"
work_dir: {root}/work
catalog:
  path: {root}/catalog.sqlite
storage:
  url: {root}/unused
  region: primary
  replicas:
    - region: dr
      url: {root}/unused-dr
compression:
  algorithm: zstd
encryption:
  enabled: true
  current_key: k1
  keys:
    - id: k1
      key_hex: "{TEST_KEY_HEX}"
databases:
  - name: {TEST_DB_NAME}
    id: {TEST_DB_ID}
    engine: wal_engine
    port: 5432
    replicate_to: [dr]
{extra_yaml}
"#
    );
    let config = parse_config(&yaml, Path::new("test.yaml")).unwrap();

    let engine = Arc::new(FixtureEngine::new(EngineKind::WalEngine));
    let primary = Arc::new(MemoryBackend::new());
    let replica = Arc::new(MemoryBackend::new());
    let notifier = Arc::new(RecordingNotifier::default());
    let sandbox = Arc::new(FixtureSandbox::default());

    let store = ObjectStore::new("primary", primary.clone()).with_region("dr", replica.clone());
    let adapters = AdapterRegistry::new().with(engine.clone(), Duration::from_secs(30));
    let vault = Vault::from_parts(
        config,
        Arc::new(SqliteCatalog::open_in_memory().unwrap()),
        store,
        adapters,
        notifier.clone(),
        sandbox.clone(),
    )
    .unwrap();

    TestVault {
        vault,
        engine,
        primary,
        replica,
        notifier,
        sandbox,
        dir,
    }
}

/// Completed record of the test database, chained to `parent` when given.
/// Its end marker is the creation time in seconds.
pub fn record(
    backup_type: BackupType,
    created_at: DateTime<Utc>,
    parent: Option<&BackupRecord>,
) -> BackupRecord {
    let id = Uuid::new_v4();
    let engine = EngineKind::WalEngine;
    BackupRecord {
        id,
        database_id: TEST_DB_ID,
        database_name: TEST_DB_NAME.into(),
        engine,
        backup_type,
        storage_key: artifact_key(engine, TEST_DB_NAME, created_at, backup_type, id),
        size_bytes: 100,
        checksum: None,
        compression_applied: false,
        encryption_applied: false,
        engine_metadata: EngineMetadata {
            pitr_capable: true,
            marker: Some(ReplayMarker::new(engine, created_at.timestamp().to_string())),
            parent_backup_id: parent.map(|p| p.id),
            captured_at: Some(created_at),
            ..Default::default()
        },
        replication_status: BTreeMap::new(),
        status: RunStatus::Completed,
        failure_reason: None,
        created_at,
        completed_at: Some(created_at),
    }
}
