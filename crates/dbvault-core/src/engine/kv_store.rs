//! Redis-compatible key-value store. Snapshots only: there is no replay log
//! to chain incrementals from.

use std::cmp::Ordering;
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, Utc};
use tracing::info;

use super::{DumpRequest, EngineAdapter, ExecContext, ReplayStats, parse_count, tool};
use crate::config::EngineSettings;
use crate::error::{Result, VaultError};
use crate::model::{BackupType, DatabaseHandle, EngineKind, EngineMetadata, ReplayMarker};
use crate::platform::process::{self, StdoutTarget, command_for_script};

const KIND: EngineKind = EngineKind::KvStore;

pub const DEFAULT_RESTORE_COMMAND: &str =
    "rdb --command protocol {artifact} | redis-cli -h {host} -p {port} --pipe";

pub struct KvStoreAdapter {
    settings: EngineSettings,
}

impl KvStoreAdapter {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    fn cli(&self, handle: &DatabaseHandle) -> Command {
        let mut cmd = tool(&self.settings, "redis-cli");
        cmd.arg("-h")
            .arg(&handle.host)
            .arg("-p")
            .arg(handle.port.to_string());
        if !handle.credentials.username.is_empty() {
            cmd.arg("--user").arg(&handle.credentials.username);
        }
        if !handle.credentials.password.is_empty() {
            cmd.env("REDISCLI_AUTH", &handle.credentials.password);
        }
        cmd
    }

    fn command(&self, handle: &DatabaseHandle, args: &[&str], ctx: &ExecContext<'_>) -> Result<String> {
        let mut cmd = self.cli(handle);
        cmd.args(args);
        let out = process::run(&mut cmd, None, StdoutTarget::Capture, ctx.timeout, ctx.cancel)?;
        Ok(out.stdout_text())
    }

    fn restore_script(&self, handle: &DatabaseHandle, artifact: &Path) -> String {
        let template = self
            .settings
            .restore_command
            .as_deref()
            .unwrap_or(DEFAULT_RESTORE_COMMAND);
        template
            .replace("{artifact}", &shell_quote(&artifact.to_string_lossy()))
            .replace("{host}", &shell_quote(&handle.host))
            .replace("{port}", &handle.port.to_string())
    }
}

fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn no_replay_log() -> VaultError {
    VaultError::UnsupportedOperation("kv_store has no replay log".into())
}

impl EngineAdapter for KvStoreAdapter {
    fn kind(&self) -> EngineKind {
        KIND
    }

    fn pitr_capable(&self) -> bool {
        false
    }

    fn dump(&self, req: &DumpRequest<'_>, ctx: &ExecContext<'_>) -> Result<EngineMetadata> {
        if req.backup_type == BackupType::Incremental {
            return Err(VaultError::UnsupportedOperation(
                "kv_store does not support incremental backups".into(),
            ));
        }
        let mut cmd = self.cli(req.handle);
        cmd.arg("--rdb").arg(req.output);
        let captured_at = Utc::now();
        process::run(&mut cmd, None, StdoutTarget::Discard, ctx.timeout, ctx.cancel)?;
        Ok(EngineMetadata {
            pitr_capable: false,
            captured_at: Some(captured_at),
            ..Default::default()
        })
    }

    fn read_marker(
        &self,
        _handle: &DatabaseHandle,
        _ctx: &ExecContext<'_>,
    ) -> Result<Option<ReplayMarker>> {
        Ok(None)
    }

    fn apply_dump(
        &self,
        handle: &DatabaseHandle,
        artifact: &Path,
        _metadata: &EngineMetadata,
        ctx: &ExecContext<'_>,
    ) -> Result<()> {
        info!(database = %handle.database, "loading RDB snapshot");
        let mut cmd = command_for_script(&self.restore_script(handle, artifact));
        if !handle.credentials.password.is_empty() {
            cmd.env("REDISCLI_AUTH", &handle.credentials.password);
        }
        process::run(&mut cmd, None, StdoutTarget::Discard, ctx.timeout, ctx.cancel)?;
        Ok(())
    }

    fn apply_replay_up_to(
        &self,
        _handle: &DatabaseHandle,
        _replay: &Path,
        _target: Option<DateTime<Utc>>,
        _ctx: &ExecContext<'_>,
    ) -> Result<ReplayStats> {
        Err(no_replay_log())
    }

    fn compare_markers(&self, _a: &ReplayMarker, _b: &ReplayMarker) -> Result<Ordering> {
        Err(no_replay_log())
    }

    fn ping(&self, handle: &DatabaseHandle, ctx: &ExecContext<'_>) -> Result<()> {
        let out = self.command(handle, &["PING"], ctx)?;
        if out.trim() == "PONG" {
            Ok(())
        } else {
            Err(VaultError::EngineUnreachable(format!(
                "PING answered '{}'",
                out.trim()
            )))
        }
    }

    fn count_objects(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<Option<u64>> {
        let out = self.command(handle, &["DBSIZE"], ctx)?;
        parse_count("redis-cli", &out).map(Some)
    }
}
