use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::cancel::CancelToken;
use crate::error::{Result, VaultError};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const STDERR_TAIL_BYTES: usize = 4096;

/// Stderr fragments that mean the tool never reached the server.
const CONNECTION_PATTERNS: &[&str] = &[
    "can't connect",
    "connection refused",
    "could not connect",
    "connection to server",
    "no route to host",
    "name or service not known",
    "could not translate host name",
    "lost connection",
    "connection reset",
    "server selection timed out",
    "mongonetworkerror",
    "could not connect to redis",
    "timed out",
];

/// Where the child's stdout goes.
#[derive(Debug, Clone, Copy)]
pub enum StdoutTarget<'a> {
    Capture,
    File(&'a Path),
    Discard,
}

#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Build a shell command for the current platform.
pub fn command_for_script(script: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script);
    cmd
}

/// Run a native tool to completion.
///
/// The child is killed when `timeout` elapses (reported as
/// `EngineUnreachable`) or when `cancel` fires (reported as `Cancelled`).
/// Stderr is drained on a helper thread so a chatty tool cannot block on a
/// full pipe while we poll.
pub fn run(
    cmd: &mut Command,
    stdin: Option<&Path>,
    stdout: StdoutTarget<'_>,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<ProcessOutput> {
    cancel.check()?;
    let tool = tool_name(cmd);

    match stdin {
        Some(path) => cmd.stdin(Stdio::from(File::open(path)?)),
        None => cmd.stdin(Stdio::null()),
    };
    match stdout {
        StdoutTarget::Capture => cmd.stdout(Stdio::piped()),
        StdoutTarget::File(path) => cmd.stdout(Stdio::from(File::create(path)?)),
        StdoutTarget::Discard => cmd.stdout(Stdio::null()),
    };
    cmd.stderr(Stdio::piped());

    debug!(tool = %tool, "spawning native tool");
    let mut child = spawn(cmd, &tool)?;

    let stdout_reader = child.stdout.take().map(drain);
    let stderr_reader = child.stderr.take().map(drain);

    let status = wait_with_deadline(&mut child, &tool, timeout, cancel)?;

    let stdout = join_drain(stdout_reader);
    let stderr = String::from_utf8_lossy(&join_drain(stderr_reader)).into_owned();

    if !status.success() {
        return Err(classify_failure(&tool, status.code(), &stderr));
    }
    Ok(ProcessOutput { stdout, stderr })
}

fn spawn(cmd: &mut Command, tool: &str) -> Result<Child> {
    cmd.spawn().map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            VaultError::Config(format!("native tool '{tool}' not found on PATH"))
        } else {
            VaultError::Io(e)
        }
    })
}

fn wait_with_deadline(
    child: &mut Child,
    tool: &str,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<std::process::ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            debug!(tool, "killed native tool on cancellation");
            return Err(VaultError::Cancelled);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(VaultError::EngineUnreachable(format!(
                "{tool} timed out after {} seconds",
                timeout.as_secs()
            )));
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn drain<R: Read + Send + 'static>(mut reader: R) -> JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

fn join_drain(handle: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn tool_name(cmd: &Command) -> String {
    let program = cmd.get_program().to_string_lossy();
    Path::new(program.as_ref())
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.into_owned())
}

/// Map a non-zero exit to the error kind callers act on.
pub fn classify_failure(tool: &str, code: Option<i32>, stderr: &str) -> VaultError {
    let lowered = stderr.to_ascii_lowercase();
    let tail = tail(stderr);
    if CONNECTION_PATTERNS.iter().any(|p| lowered.contains(p)) {
        return VaultError::EngineUnreachable(format!("{tool}: {tail}"));
    }
    VaultError::Engine {
        tool: tool.to_string(),
        code: code.unwrap_or(-1),
        stderr: tail,
    }
}

fn tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

/// A long-lived child fed line by line, used where a server session must
/// stay open while another tool runs (e.g. an exported snapshot).
pub struct InteractiveSession {
    tool: String,
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<String>,
    stderr: Option<JoinHandle<Vec<u8>>>,
}

impl InteractiveSession {
    pub fn spawn(cmd: &mut Command) -> Result<Self> {
        let tool = tool_name(cmd);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = spawn(cmd, &tool)?;

        let stdin = child.stdin.take();
        let stderr = child.stderr.take().map(drain);
        let (tx, rx) = mpsc::channel();
        if let Some(out) = child.stdout.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(out).lines() {
                    let Ok(line) = line else { break };
                    if tx.send(line).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(Self {
            tool,
            child,
            stdin,
            lines: rx,
            stderr,
        })
    }

    pub fn send(&mut self, line: &str) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| VaultError::Other(format!("{} session stdin closed", self.tool)))?;
        writeln!(stdin, "{line}")?;
        stdin.flush()?;
        Ok(())
    }

    /// Read output lines until `done` returns true for one of them; that
    /// line is returned.
    pub fn read_until(
        &mut self,
        timeout: Duration,
        cancel: &CancelToken,
        mut done: impl FnMut(&str) -> bool,
    ) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            cancel.check()?;
            match self.lines.recv_timeout(POLL_INTERVAL) {
                Ok(line) if done(&line) => return Ok(line),
                Ok(_) => {}
                Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    let _ = self.child.wait();
                    let stderr = String::from_utf8_lossy(&join_drain(self.stderr.take()))
                        .into_owned();
                    return Err(classify_failure(&self.tool, None, &stderr));
                }
            }
            if Instant::now() >= deadline {
                return Err(VaultError::EngineUnreachable(format!(
                    "{} session did not answer within {} seconds",
                    self.tool,
                    timeout.as_secs()
                )));
            }
        }
    }

    /// Close stdin and wait briefly for a clean exit; kill otherwise.
    pub fn close(mut self) {
        self.stdin.take();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
