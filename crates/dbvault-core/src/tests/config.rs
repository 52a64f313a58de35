use std::path::Path;

use crate::config::{
    CompressionAlgorithm, RestoreTestMode, load_config, minimal_config_template, parse_config,
};
use crate::error::VaultError;
use crate::model::EngineKind;

const BASE: &str = r#"
storage:
  url: /srv/backups
  replicas:
    - region: dr
      url: /srv/backups-dr
databases:
  - name: orders
    id: 6f1c9a52-8d4b-4e1f-9a7e-2b8c3d4e5f60
    engine: wal_engine
    port: 5432
"#;

fn parse(yaml: &str) -> crate::error::Result<crate::config::VaultConfig> {
    parse_config(yaml, Path::new("dbvault.yaml"))
}

fn config_error(yaml: &str) -> String {
    match parse(yaml) {
        Err(VaultError::Config(msg)) => msg,
        other => panic!("expected config error, got {other:?}"),
    }
}

#[test]
fn defaults_fill_optional_sections() {
    let config = parse(BASE).unwrap();
    let db = config.database("orders").unwrap();
    assert_eq!(db.engine, EngineKind::WalEngine);
    assert_eq!(db.host, "127.0.0.1");
    assert_eq!(db.handle().unwrap().database, "orders");

    assert_eq!(config.storage.region, "primary");
    assert_eq!(config.compression.algorithm, CompressionAlgorithm::Zstd);
    assert!(!config.encryption.enabled);
    assert!(!config.retention.has_any_rule());
    assert!(!config.restore_test.enabled);
    assert_eq!(config.restore_test.mode, RestoreTestMode::Full);
    assert_eq!(config.watchdog.max_run_duration, "6h");
}

#[test]
fn unknown_database_lookup_fails() {
    let config = parse(BASE).unwrap();
    assert!(matches!(config.database("users"), Err(VaultError::Config(_))));
}

#[test]
fn duplicate_database_names_are_rejected() {
    let yaml = format!(
        "{BASE}  - name: orders\n    id: 0b9d8c7e-1111-4222-8333-944455556666\n    engine: row_store\n    port: 3306\n"
    );
    assert!(config_error(&yaml).contains("duplicate database name"));
}

#[test]
fn replication_to_unknown_region_is_rejected() {
    let yaml = BASE.replace("port: 5432", "port: 5432\n    replicate_to: [mars]");
    assert!(config_error(&yaml).contains("unknown region 'mars'"));
}

#[test]
fn encryption_needs_a_listed_current_key() {
    let missing = format!("{BASE}encryption:\n  enabled: true\n");
    assert!(config_error(&missing).contains("current_key"));

    let unlisted = format!(
        "{BASE}encryption:\n  enabled: true\n  current_key: k9\n  keys:\n    - id: k1\n      key_env: SOME_KEY\n"
    );
    assert!(config_error(&unlisted).contains("'k9'"));
}

#[test]
fn env_placeholder_defaults_are_expanded() {
    let yaml = BASE.replace(
        "url: /srv/backups\n",
        "url: ${DBVAULT_TEST_SURELY_UNSET_STORAGE:-/srv/from-default}\n",
    );
    let config = parse(&yaml).unwrap();
    assert_eq!(config.storage.url, "/srv/from-default");
}

#[test]
fn unset_env_placeholder_reports_position() {
    let yaml = BASE.replace(
        "url: /srv/backups\n",
        "url: ${DBVAULT_TEST_SURELY_UNSET_STORAGE}\n",
    );
    let msg = config_error(&yaml);
    assert!(msg.contains("DBVAULT_TEST_SURELY_UNSET_STORAGE"), "{msg}");
    assert!(msg.contains("line 3"), "{msg}");
}

#[test]
fn invalid_durations_are_rejected_while_parsing() {
    let yaml = format!("{BASE}watchdog:\n  max_run_duration: soon\n");
    assert!(config_error(&yaml).contains("invalid config"));
}

#[test]
fn template_parses_once_placeholders_resolve() {
    let text = minimal_config_template()
        .replace("${DBVAULT_S3_ACCESS_KEY}", "${DBVAULT_S3_ACCESS_KEY:-ak}")
        .replace("${DBVAULT_S3_SECRET_KEY}", "${DBVAULT_S3_SECRET_KEY:-sk}");
    let config = parse(&text).unwrap();
    assert!(config.encryption.enabled);
    assert!(config.retention.has_any_rule());
    assert_eq!(config.databases.len(), 1);
}

#[test]
fn load_reports_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_config(&dir.path().join("absent.yaml")).unwrap_err();
    assert!(matches!(err, VaultError::Config(ref msg) if msg.contains("cannot read")));
}
