use std::fmt;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::config::RetryConfig;
use crate::error::VaultError;

/// Failure of one HTTP exchange (request plus body transfer).
pub enum HttpRetryError {
    /// Transport or status error; transport, 429 and 5xx are retried.
    Http(Box<ureq::Error>),
    /// Body transfer failed; connection-level kinds are retried.
    BodyIo(std::io::Error),
    /// Never retried.
    Permanent(String),
    Cancelled,
}

impl HttpRetryError {
    pub fn http(e: ureq::Error) -> Self {
        HttpRetryError::Http(Box::new(e))
    }

    fn is_retryable(&self) -> bool {
        match self {
            HttpRetryError::Http(e) => is_retryable_http(e),
            HttpRetryError::BodyIo(e) => is_retryable_io(e),
            HttpRetryError::Permanent(_) | HttpRetryError::Cancelled => false,
        }
    }

    /// Convert to the application error for `op` against `backend`.
    pub fn into_vault(self, backend: &str, op: &str) -> VaultError {
        match self {
            HttpRetryError::Cancelled => VaultError::Cancelled,
            HttpRetryError::BodyIo(e) => match VaultError::from_io(e) {
                VaultError::Io(e) => VaultError::StorageUnavailable(format!("{backend} {op}: {e}")),
                other => other,
            },
            HttpRetryError::Http(e) => match *e {
                ureq::Error::Status(code, _) if (400..500).contains(&code) && code != 429 => {
                    VaultError::Other(format!("{backend} {op}: HTTP {code}"))
                }
                other => VaultError::StorageUnavailable(format!("{backend} {op}: {other}")),
            },
            HttpRetryError::Permanent(msg) => VaultError::Other(format!("{backend} {op}: {msg}")),
        }
    }
}

impl fmt::Display for HttpRetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpRetryError::Http(e) => write!(f, "{e}"),
            HttpRetryError::BodyIo(e) => write!(f, "body transfer error: {e}"),
            HttpRetryError::Permanent(msg) => f.write_str(msg),
            HttpRetryError::Cancelled => f.write_str("cancelled"),
        }
    }
}

pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Delay before attempt `attempt` (1-based retry count): exponential, capped,
/// plus up to the same amount of random jitter.
fn backoff(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config
        .retry_delay_ms
        .saturating_mul(1u64 << attempt.saturating_sub(1).min(20))
        .min(config.retry_max_delay_ms);
    let jitter = rand::random::<u64>() % base.max(1);
    Duration::from_millis(base + jitter)
}

/// Sleep in small slices so a cancelled run does not wait out a long backoff.
fn sleep_cancellable(total: Duration, cancel: &CancelToken) -> bool {
    let slice = Duration::from_millis(100);
    let mut left = total;
    while !left.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let step = left.min(slice);
        std::thread::sleep(step);
        left -= step;
    }
    !cancel.is_cancelled()
}

/// Run `f` until it succeeds, fails permanently, or retries are exhausted.
pub fn retry_http<T>(
    config: &RetryConfig,
    op_name: &str,
    backend_label: &str,
    cancel: &CancelToken,
    mut f: impl FnMut() -> std::result::Result<T, HttpRetryError>,
) -> std::result::Result<T, HttpRetryError> {
    let mut attempt: u32 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(HttpRetryError::Cancelled);
        }
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_retryable() && (attempt as usize) < config.max_retries => {
                attempt += 1;
                tracing::warn!(
                    backend = backend_label,
                    op = op_name,
                    attempt,
                    max_retries = config.max_retries,
                    error = %e,
                    "transient storage error, retrying"
                );
                if !sleep_cancellable(backoff(config, attempt), cancel) {
                    return Err(HttpRetryError::Cancelled);
                }
            }
            Err(e) => return Err(e),
        }
    }
}
