//! Ephemeral restore targets for restore tests.

use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;

use rand::RngCore;
use tracing::{debug, info};
use uuid::Uuid;

use crate::cancel::CancelToken;
use crate::error::{Result, VaultError};
use crate::model::{Credentials, DatabaseHandle, EngineKind};
use crate::platform::process::{self, StdoutTarget};

const DOCKER_TIMEOUT: Duration = Duration::from_secs(300);
const SANDBOX_LABEL: &str = "dbvault.sandbox=1";

/// A provisioned target. `id` identifies it to the provisioner for teardown.
#[derive(Debug, Clone)]
pub struct Sandbox {
    pub id: String,
    pub handle: DatabaseHandle,
}

pub trait SandboxProvisioner: Send + Sync {
    /// Start an empty instance of `engine` that will receive `database`.
    fn provision(&self, engine: EngineKind, database: &str, cancel: &CancelToken)
    -> Result<Sandbox>;

    fn teardown(&self, sandbox: &Sandbox) -> Result<()>;
}

/// Image, internal port and launch parameters for one engine kind.
struct EngineImage {
    image: String,
    port: u16,
    username: &'static str,
    env: Vec<(String, String)>,
    args: Vec<String>,
}

fn default_image(engine: EngineKind) -> &'static str {
    match engine {
        EngineKind::RowStore => "mysql:8.0",
        EngineKind::WalEngine => "postgres:16",
        EngineKind::DocumentStore => "mongo:7",
        EngineKind::KvStore => "redis:7",
    }
}

/// One container per restore test, removed on teardown.
pub struct DockerSandbox {
    docker: String,
    images: BTreeMap<EngineKind, String>,
}

impl DockerSandbox {
    pub fn new(docker: impl Into<String>, images: BTreeMap<EngineKind, String>) -> Self {
        Self {
            docker: docker.into(),
            images,
        }
    }

    fn image_for(&self, engine: EngineKind, database: &str, password: &str) -> EngineImage {
        let image = self
            .images
            .get(&engine)
            .cloned()
            .unwrap_or_else(|| default_image(engine).to_string());
        let pw = password.to_string();
        match engine {
            EngineKind::RowStore => EngineImage {
                image,
                port: 3306,
                username: "root",
                env: vec![("MYSQL_ROOT_PASSWORD".into(), pw)],
                args: Vec::new(),
            },
            EngineKind::WalEngine => EngineImage {
                image,
                port: 5432,
                username: "postgres",
                env: vec![
                    ("POSTGRES_PASSWORD".into(), pw),
                    ("POSTGRES_DB".into(), database.to_string()),
                ],
                args: Vec::new(),
            },
            EngineKind::DocumentStore => EngineImage {
                image,
                port: 27017,
                username: "root",
                env: vec![
                    ("MONGO_INITDB_ROOT_USERNAME".into(), "root".into()),
                    ("MONGO_INITDB_ROOT_PASSWORD".into(), pw),
                ],
                args: Vec::new(),
            },
            EngineKind::KvStore => EngineImage {
                image,
                port: 6379,
                username: "",
                env: Vec::new(),
                args: vec!["redis-server".into(), "--requirepass".into(), pw],
            },
        }
    }

    fn docker(&self, args: &[&str], cancel: &CancelToken) -> Result<String> {
        let mut cmd = Command::new(&self.docker);
        cmd.args(args);
        let out = process::run(&mut cmd, None, StdoutTarget::Capture, DOCKER_TIMEOUT, cancel)?;
        Ok(out.stdout_text())
    }
}

/// Host port from `docker port` output such as `0.0.0.0:49153`.
fn parse_published_port(output: &str) -> Option<u16> {
    output
        .lines()
        .filter_map(|l| l.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

fn random_password() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

impl SandboxProvisioner for DockerSandbox {
    fn provision(
        &self,
        engine: EngineKind,
        database: &str,
        cancel: &CancelToken,
    ) -> Result<Sandbox> {
        let password = random_password();
        let spec = self.image_for(engine, database, &password);
        let name = format!("dbvault-test-{}", &Uuid::new_v4().simple().to_string()[..12]);

        let mut cmd = Command::new(&self.docker);
        cmd.args(["run", "--detach", "--publish-all", "--label", SANDBOX_LABEL])
            .arg("--name")
            .arg(&name);
        for (key, value) in &spec.env {
            // Values are read from this process's environment, not argv.
            cmd.arg("--env").arg(key).env(key, value);
        }
        cmd.arg(&spec.image).args(&spec.args);
        let out = process::run(&mut cmd, None, StdoutTarget::Capture, DOCKER_TIMEOUT, cancel)?;
        let container = out.stdout_text().trim().to_string();
        if container.is_empty() {
            return Err(VaultError::Other(format!(
                "docker run for {} printed no container id",
                spec.image
            )));
        }

        let sandbox = |port| Sandbox {
            id: container.clone(),
            handle: DatabaseHandle {
                id: Uuid::new_v4(),
                engine,
                host: "127.0.0.1".into(),
                port,
                credentials: Credentials {
                    username: spec.username.to_string(),
                    password: password.clone(),
                },
                database: database.to_string(),
            },
        };

        let port_out = match self.docker(&["port", &container, &format!("{}/tcp", spec.port)], cancel) {
            Ok(out) => out,
            Err(e) => {
                let _ = self.teardown(&sandbox(0));
                return Err(e);
            }
        };
        let Some(port) = parse_published_port(&port_out) else {
            let _ = self.teardown(&sandbox(0));
            return Err(VaultError::Other(format!(
                "could not read published port of {name}: {}",
                port_out.trim()
            )));
        };

        info!(engine = %engine, container = %name, port, "sandbox provisioned");
        Ok(sandbox(port))
    }

    fn teardown(&self, sandbox: &Sandbox) -> Result<()> {
        debug!(container = %sandbox.id, "removing sandbox");
        // Teardown must still run after the run itself was cancelled.
        self.docker(&["rm", "--force", "--volumes", &sandbox.id], &CancelToken::new())?;
        Ok(())
    }
}
