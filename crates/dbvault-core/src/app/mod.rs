use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use crate::cancel::CancelToken;
use crate::catalog::{Catalog, SqliteCatalog};
use crate::config::{self, ConfigSource, VaultConfig, parse_chrono_duration};
use crate::engine::{AdapterRegistry, EngineAdapter, ExecContext};
use crate::error::{Result, VaultError};
use crate::lock::DatabaseLocks;
use crate::model::EngineKind;
use crate::notify::{FanoutNotifier, HookNotifier, LogNotifier, Notifier};
use crate::pipeline::keyring::KeyRing;
use crate::sandbox::{DockerSandbox, SandboxProvisioner};
use crate::storage::ObjectStore;

pub mod daemon;
pub mod scheduler;

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub source: ConfigSource,
    pub config: VaultConfig,
}

pub fn load_runtime_config(config_path: Option<&str>) -> Result<RuntimeConfig> {
    let source = config::resolve_config_path(config_path).ok_or_else(|| {
        VaultError::Config("no configuration file found in default search paths".into())
    })?;
    let config = config::load_config(source.path())?;
    Ok(RuntimeConfig { source, config })
}

/// Everything a run needs, shared by every command and daemon worker.
pub struct Vault {
    pub config: VaultConfig,
    pub catalog: Arc<dyn Catalog>,
    pub store: ObjectStore,
    pub adapters: AdapterRegistry,
    pub keyring: Option<KeyRing>,
    pub locks: DatabaseLocks,
    pub notifier: Arc<dyn Notifier>,
    pub sandbox: Arc<dyn SandboxProvisioner>,
}

impl Vault {
    /// Wire up the native adapters, storage, catalog and notifiers from config.
    pub fn open(config: VaultConfig) -> Result<Self> {
        let catalog: Arc<dyn Catalog> = Arc::new(SqliteCatalog::open(&config.catalog.path)?);
        let store = ObjectStore::from_config(&config.storage)?;
        let adapters = AdapterRegistry::native(&config.engines)?;
        let mut notifiers: Vec<Arc<dyn Notifier>> = vec![Arc::new(LogNotifier)];
        if !config.hooks.is_empty() {
            notifiers.push(Arc::new(HookNotifier::new(config.hooks.clone())));
        }
        let sandbox = Arc::new(DockerSandbox::new(
            config.restore_test.docker.clone(),
            config.restore_test.images.clone(),
        ));
        Self::from_parts(
            config,
            catalog,
            store,
            adapters,
            Arc::new(FanoutNotifier::new(notifiers)),
            sandbox,
        )
    }

    pub fn from_parts(
        config: VaultConfig,
        catalog: Arc<dyn Catalog>,
        store: ObjectStore,
        adapters: AdapterRegistry,
        notifier: Arc<dyn Notifier>,
        sandbox: Arc<dyn SandboxProvisioner>,
    ) -> Result<Self> {
        let keyring = KeyRing::from_config(&config.encryption)?;
        // A run older than the watchdog limit is presumed dead; so is its claim.
        let stale_after = parse_chrono_duration(&config.watchdog.max_run_duration)?;
        let locks = DatabaseLocks::shared(Arc::clone(&catalog), stale_after);
        Ok(Self {
            config,
            catalog,
            store,
            adapters,
            keyring,
            locks,
            notifier,
            sandbox,
        })
    }

    pub fn work_dir(&self) -> &Path {
        &self.config.work_dir
    }

    /// Private scratch directory for one run, removed on drop.
    pub fn scratch_dir(&self, prefix: &str) -> Result<TempDir> {
        std::fs::create_dir_all(&self.config.work_dir)?;
        Ok(tempfile::Builder::new()
            .prefix(prefix)
            .tempdir_in(&self.config.work_dir)?)
    }

    pub fn adapter(&self, kind: EngineKind) -> Result<Arc<dyn EngineAdapter>> {
        self.adapters.adapter_for(kind)
    }

    pub fn exec_context<'a>(&self, kind: EngineKind, cancel: &'a CancelToken) -> ExecContext<'a> {
        ExecContext {
            cancel,
            timeout: self.adapters.timeout_for(kind),
        }
    }
}
