use std::path::PathBuf;
use std::time::Duration;

use super::types::{CompressionAlgorithm, RestoreTestMode};
use crate::error::{Result, VaultError};

pub(super) fn default_work_dir() -> PathBuf {
    std::env::temp_dir().join("dbvault")
}

pub(super) fn default_catalog_path() -> PathBuf {
    PathBuf::from("dbvault.sqlite")
}

pub(super) fn default_region() -> String {
    "primary".to_string()
}

pub(super) fn default_max_retries() -> usize {
    3
}

pub(super) fn default_retry_delay_ms() -> u64 {
    1000
}

pub(super) fn default_retry_max_delay_ms() -> u64 {
    60_000
}

pub(super) fn default_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Zstd
}

pub(super) fn default_zstd_level() -> i32 {
    3
}

pub(super) fn default_engine_timeout() -> String {
    "4h".to_string()
}

pub(super) fn default_host() -> String {
    "127.0.0.1".to_string()
}

pub(super) fn default_purge_failed_after() -> Option<String> {
    Some("7d".to_string())
}

pub(super) fn default_restore_test_every() -> String {
    "6h".to_string()
}

pub(super) fn default_test_interval() -> String {
    "7d".to_string()
}

pub(super) fn default_max_per_sweep() -> usize {
    2
}

pub(super) fn default_restore_test_mode() -> RestoreTestMode {
    RestoreTestMode::Full
}

pub(super) fn default_docker_binary() -> String {
    "docker".to_string()
}

pub(super) fn default_watchdog_every() -> String {
    "15m".to_string()
}

pub(super) fn default_max_run_duration() -> String {
    "6h".to_string()
}

pub(super) fn default_retention_every() -> String {
    "24h".to_string()
}

/// Parse a duration string like "45s", "30m", "4h", "2d" or "1w".
/// A bare number is taken as days.
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(VaultError::Config("duration must not be empty".into()));
    }

    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        _ => (input, None),
    };

    let value: u64 = num_part
        .parse()
        .map_err(|_| VaultError::Config(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        Some('s') | Some('S') => value,
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some('w') | Some('W') => value.saturating_mul(60 * 60 * 24 * 7),
        Some(other) => {
            return Err(VaultError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use s/m/h/d/w)"
            )));
        }
        None => value.saturating_mul(60 * 60 * 24),
    };

    if secs == 0 {
        return Err(VaultError::Config(
            "duration must be greater than zero".into(),
        ));
    }

    Ok(Duration::from_secs(secs))
}

/// Same grammar as [`parse_human_duration`], as a `chrono::Duration` for
/// arithmetic on record timestamps.
pub fn parse_chrono_duration(raw: &str) -> Result<chrono::Duration> {
    let std = parse_human_duration(raw)?;
    chrono::Duration::from_std(std)
        .map_err(|_| VaultError::Config(format!("duration out of range: '{raw}'")))
}
