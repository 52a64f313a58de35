use std::fmt;
use std::path::{Path, PathBuf};

use super::types::VaultConfig;
use crate::error::{Result, VaultError};

pub const CONFIG_ENV_VAR: &str = "DBVAULT_CONFIG";

/// Load, expand and validate a config file.
pub fn load_config(path: &Path) -> Result<VaultConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| VaultError::Config(format!("cannot read '{}': {e}", path.display())))?;
    parse_config(&contents, path)
}

/// Parse config text; `path` is only used in error messages.
pub fn parse_config(contents: &str, path: &Path) -> Result<VaultConfig> {
    let expanded = expand_env_placeholders(contents, path)?;
    let config: VaultConfig = serde_yaml::from_str(&expanded)
        .map_err(|e| VaultError::Config(format!("invalid config '{}': {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Expand `${VAR}` and `${VAR:-default}` placeholders in raw config text.
fn expand_env_placeholders(input: &str, path: &Path) -> Result<String> {
    let mut out = String::with_capacity(input.len());
    let mut cursor = 0usize;

    while let Some(offset) = input[cursor..].find("${") {
        let start = cursor + offset;
        out.push_str(&input[cursor..start]);

        let token_start = start + 2;
        let Some(token_end_rel) = input[token_start..].find('}') else {
            return Err(expand_error(
                path,
                input,
                start,
                "unterminated environment placeholder",
            ));
        };
        let token_end = token_start + token_end_rel;
        let token = &input[token_start..token_end];
        out.push_str(&resolve_env_token(token, path, input, start)?);
        cursor = token_end + 1;
    }

    out.push_str(&input[cursor..]);
    Ok(out)
}

fn resolve_env_token(token: &str, path: &Path, input: &str, start: usize) -> Result<String> {
    let (name, default) = match token.find(":-") {
        Some(split_at) => (&token[..split_at], Some(&token[split_at + 2..])),
        None => (token, None),
    };

    if !is_valid_env_var_name(name) {
        return Err(expand_error(
            path,
            input,
            start,
            format!("invalid environment placeholder '{token}'"),
        ));
    }

    match (std::env::var(name), default) {
        (Ok(value), Some(default)) if value.is_empty() => Ok(default.to_string()),
        (Ok(value), _) => Ok(value),
        (Err(std::env::VarError::NotPresent), Some(default)) => Ok(default.to_string()),
        (Err(std::env::VarError::NotPresent), None) => Err(expand_error(
            path,
            input,
            start,
            format!("environment variable '{name}' is not set"),
        )),
        (Err(std::env::VarError::NotUnicode(_)), _) => Err(expand_error(
            path,
            input,
            start,
            format!("environment variable '{name}' is not valid UTF-8"),
        )),
    }
}

fn is_valid_env_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    (first == '_' || first.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

fn expand_error(path: &Path, input: &str, start: usize, message: impl fmt::Display) -> VaultError {
    let line = input[..start].matches('\n').count() + 1;
    let column = input[..start]
        .rsplit('\n')
        .next()
        .map_or(0, |l| l.chars().count())
        + 1;
    VaultError::Config(format!(
        "invalid config '{}': {message} at line {line}, column {column}",
        path.display()
    ))
}

/// Tracks where the config file was found.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    CliArg(PathBuf),
    EnvVar(PathBuf),
    SearchOrder { path: PathBuf, level: &'static str },
}

impl ConfigSource {
    pub fn path(&self) -> &Path {
        match self {
            ConfigSource::CliArg(p) | ConfigSource::EnvVar(p) => p,
            ConfigSource::SearchOrder { path, .. } => path,
        }
    }
}

impl fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigSource::CliArg(p) => write!(f, "{} (--config)", p.display()),
            ConfigSource::EnvVar(p) => write!(f, "{} ({CONFIG_ENV_VAR})", p.display()),
            ConfigSource::SearchOrder { path, level } => {
                write!(f, "{} ({level})", path.display())
            }
        }
    }
}

pub fn default_config_search_paths() -> Vec<(PathBuf, &'static str)> {
    vec![
        (PathBuf::from("dbvault.yaml"), "project"),
        (PathBuf::from("/etc/dbvault/config.yaml"), "system"),
    ]
}

/// Priority: CLI arg > `DBVAULT_CONFIG` > first existing search path.
pub fn resolve_config_path(cli_config: Option<&str>) -> Option<ConfigSource> {
    if let Some(path) = cli_config {
        return Some(ConfigSource::CliArg(PathBuf::from(path)));
    }

    if let Ok(val) = std::env::var(CONFIG_ENV_VAR) {
        if !val.is_empty() {
            return Some(ConfigSource::EnvVar(PathBuf::from(val)));
        }
    }

    default_config_search_paths()
        .into_iter()
        .find(|(path, _)| path.exists())
        .map(|(path, level)| ConfigSource::SearchOrder { path, level })
}

pub fn minimal_config_template() -> &'static str {
    r#"# dbvault configuration file

work_dir: /var/lib/dbvault/work
catalog:
  path: /var/lib/dbvault/catalog.sqlite

storage:
  url: s3://backups/dbvault
  region: eu-central-1
  endpoint: https://s3.eu-central-1.amazonaws.com
  access_key_id: ${DBVAULT_S3_ACCESS_KEY}
  secret_access_key: ${DBVAULT_S3_SECRET_KEY}
  # replicas:
  #   - region: us-east-1
  #     url: s3://backups-dr/dbvault
  #     endpoint: https://s3.us-east-1.amazonaws.com

compression:
  algorithm: zstd
  zstd_level: 3

encryption:
  enabled: true
  current_key: k1
  keys:
    - id: k1
      key_env: DBVAULT_KEY_K1

databases:
  - name: orders
    id: 6f1c9a52-8d4b-4e1f-9a7e-2b8c3d4e5f60
    engine: wal_engine
    host: db.internal
    port: 5432
    username: backup
    password_env: ORDERS_DB_PASSWORD
    schedule:
      full_every: 1d
      incremental_every: 15m

retention:
  keep_daily: 7
  keep_weekly: 4
  keep_incrementals_within: 7d

# restore_test:
#   enabled: true
#   test_interval: 7d

# hooks:
#   backup_failed:
#     - 'logger -t dbvault "backup of $DBVAULT_DATABASE failed: $DBVAULT_ERROR"'
"#
}
