use std::process::Command;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::HooksConfig;
use crate::error::{Result, VaultError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BackupCompleted,
    BackupFailed,
    ReplicationFailed,
    RestoreCompleted,
    RestoreFailed,
    IntegrityViolation,
    RestoreTestPassed,
    RestoreTestFailed,
    RunReconciled,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::BackupCompleted => "backup_completed",
            EventKind::BackupFailed => "backup_failed",
            EventKind::ReplicationFailed => "replication_failed",
            EventKind::RestoreCompleted => "restore_completed",
            EventKind::RestoreFailed => "restore_failed",
            EventKind::IntegrityViolation => "integrity_violation",
            EventKind::RestoreTestPassed => "restore_test_passed",
            EventKind::RestoreTestFailed => "restore_test_failed",
            EventKind::RunReconciled => "run_reconciled",
        }
    }

    pub fn is_failure(self) -> bool {
        !matches!(
            self,
            EventKind::BackupCompleted | EventKind::RestoreCompleted | EventKind::RestoreTestPassed
        )
    }
}

/// Fact emitted at the end of every run.
#[derive(Debug, Clone)]
pub struct RunEvent {
    pub kind: EventKind,
    pub database: String,
    pub backup_id: Option<Uuid>,
    pub restore_id: Option<Uuid>,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(kind: EventKind, database: impl Into<String>) -> Self {
        Self {
            kind,
            database: database.into(),
            backup_id: None,
            restore_id: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn backup(mut self, id: Uuid) -> Self {
        self.backup_id = Some(id);
        self
    }

    pub fn restore(mut self, id: Uuid) -> Self {
        self.restore_id = Some(id);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Fire-and-forget sink for run events. Implementations must not block the
/// caller for long and never fail it.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &RunEvent);
}

/// Writes events to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &RunEvent) {
        let backup = event.backup_id.map(|id| id.to_string()).unwrap_or_default();
        if event.kind.is_failure() {
            tracing::warn!(
                event = event.kind.as_str(),
                database = %event.database,
                backup_id = %backup,
                error = event.error.as_deref().unwrap_or(""),
                "run event"
            );
        } else {
            tracing::info!(
                event = event.kind.as_str(),
                database = %event.database,
                backup_id = %backup,
                "run event"
            );
        }
    }
}

/// Runs configured shell commands for an event on a detached thread.
///
/// Commands listed under the event name run first, then those under `any`.
/// `{event}`, `{database}`, `{backup_id}` and `{error}` are substituted
/// shell-quoted, and the same values are exported as `DBVAULT_*` variables.
pub struct HookNotifier {
    hooks: HooksConfig,
}

impl HookNotifier {
    pub fn new(hooks: HooksConfig) -> Self {
        Self { hooks }
    }

    fn commands_for(&self, event: &RunEvent) -> Vec<String> {
        let mut cmds = self.hooks.get_hooks(event.kind.as_str()).to_vec();
        cmds.extend_from_slice(self.hooks.get_hooks("any"));
        cmds
    }

    /// Run the hooks for `event` on the current thread.
    pub fn run_hooks(&self, event: &RunEvent) -> Vec<Result<()>> {
        self.commands_for(event)
            .iter()
            .map(|cmd| execute_hook_command(cmd, event))
            .collect()
    }
}

impl Notifier for HookNotifier {
    fn notify(&self, event: &RunEvent) {
        let cmds = self.commands_for(event);
        if cmds.is_empty() {
            return;
        }
        let event = event.clone();
        let spawned = std::thread::Builder::new()
            .name("dbvault-hooks".into())
            .spawn(move || {
                for cmd in &cmds {
                    if let Err(e) = execute_hook_command(cmd, &event) {
                        tracing::warn!("Hook warning: {e}");
                    }
                }
            });
        if let Err(e) = spawned {
            tracing::warn!("could not start hook thread: {e}");
        }
    }
}

/// Delivers each event to every inner notifier.
pub struct FanoutNotifier {
    inner: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(inner: Vec<Arc<dyn Notifier>>) -> Self {
        Self { inner }
    }
}

impl Notifier for FanoutNotifier {
    fn notify(&self, event: &RunEvent) {
        for n in &self.inner {
            n.notify(event);
        }
    }
}

fn execute_hook_command(cmd: &str, event: &RunEvent) -> Result<()> {
    let expanded = substitute_variables(cmd, event);
    tracing::info!(event = event.kind.as_str(), "Running hook: {expanded}");

    let mut child = Command::new("sh");
    child.arg("-c").arg(&expanded);
    child.env("DBVAULT_EVENT", event.kind.as_str());
    child.env("DBVAULT_DATABASE", &event.database);
    child.env("DBVAULT_TIMESTAMP", event.at.to_rfc3339());
    if let Some(id) = event.backup_id {
        child.env("DBVAULT_BACKUP_ID", id.to_string());
    }
    if let Some(id) = event.restore_id {
        child.env("DBVAULT_RESTORE_ID", id.to_string());
    }
    if let Some(ref error) = event.error {
        child.env("DBVAULT_ERROR", error);
    }

    let output = child
        .output()
        .map_err(|e| VaultError::Other(format!("failed to execute hook '{expanded}': {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        return Err(VaultError::Other(format!(
            "hook '{expanded}' exited with {code}: {stderr}"
        )));
    }
    Ok(())
}

fn substitute_variables(cmd: &str, event: &RunEvent) -> String {
    let backup = event.backup_id.map(|id| id.to_string()).unwrap_or_default();
    cmd.replace("{event}", &shell_escape(event.kind.as_str()))
        .replace("{database}", &shell_escape(&event.database))
        .replace("{backup_id}", &shell_escape(&backup))
        .replace("{error}", &shell_escape(event.error.as_deref().unwrap_or("")))
}

fn shell_escape(input: &str) -> String {
    if input.is_empty() {
        return "''".to_string();
    }
    let escaped = input.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}
