//! PostgreSQL-compatible WAL engine.
//!
//! A logical replication slot (output plugin `wal2json`) is created per
//! database when a full is taken. The slot's exported snapshot is what
//! `pg_dump --snapshot` dumps, so the full's marker (the slot's consistent
//! point) is captured atomically with its data. Incrementals peek the slot's
//! changes past the parent's marker and translate them to SQL.

use std::cmp::Ordering;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::Command;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::replay_log::{
    self, ReplayEntry, ReplayHeader, ReplayLogWriter, ReplaySummary,
};
use super::{
    DumpRequest, EngineAdapter, ExecContext, ReplayStats, expect_engine, parse_count,
    sibling_temp, sql_ident, sql_literal, tool,
};
use crate::config::EngineSettings;
use crate::error::{Result, VaultError};
use crate::model::{BackupType, DatabaseHandle, EngineKind, EngineMetadata, ReplayMarker};
use crate::platform::process::{self, InteractiveSession, StdoutTarget};

const KIND: EngineKind = EngineKind::WalEngine;
const FORMAT: &str = "wal2json";
const OUTPUT_PLUGIN: &str = "wal2json";
const SLOT_TIMEOUT: Duration = Duration::from_secs(120);

/// Parse an LSN (`16/B374D848`) into its 64-bit position.
pub fn parse_lsn(token: &str) -> Result<u64> {
    let bad = || VaultError::InvalidFormat(format!("bad LSN '{token}'"));
    let (hi, lo) = token.trim().split_once('/').ok_or_else(bad)?;
    let hi = u64::from_str_radix(hi, 16).map_err(|_| bad())?;
    let lo = u64::from_str_radix(lo, 16).map_err(|_| bad())?;
    if hi > u64::from(u32::MAX) || lo > u64::from(u32::MAX) {
        return Err(bad());
    }
    Ok((hi << 32) | lo)
}

pub fn format_lsn(lsn: u64) -> String {
    format!("{:X}/{:X}", lsn >> 32, lsn & 0xFFFF_FFFF)
}

pub struct WalEngineAdapter {
    settings: EngineSettings,
}

impl WalEngineAdapter {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    /// Replication slot owned by one database's backups.
    pub fn slot_name(handle: &DatabaseHandle) -> String {
        format!("dbvault_{}", handle.id.simple())
    }

    fn client(&self, handle: &DatabaseHandle, name: &str) -> Command {
        let mut cmd = tool(&self.settings, name);
        cmd.arg(format!("--host={}", handle.host))
            .arg(format!("--port={}", handle.port));
        if !handle.credentials.username.is_empty() {
            cmd.arg(format!("--username={}", handle.credentials.username));
        }
        cmd.arg("--no-password")
            .env("PGPASSWORD", &handle.credentials.password);
        cmd
    }

    fn psql(&self, handle: &DatabaseHandle) -> Command {
        let mut cmd = self.client(handle, "psql");
        cmd.arg(format!("--dbname={}", handle.database))
            .args(["-X", "--quiet", "--no-align", "--tuples-only"])
            .args(["--set", "ON_ERROR_STOP=1"]);
        cmd
    }

    fn query(&self, handle: &DatabaseHandle, sql: &str, ctx: &ExecContext<'_>) -> Result<String> {
        let mut cmd = self.psql(handle);
        cmd.arg("--command").arg(sql);
        let out = process::run(&mut cmd, None, StdoutTarget::Capture, ctx.timeout, ctx.cancel)?;
        Ok(out.stdout_text())
    }

    fn current_lsn(&self, handle: &DatabaseHandle, ctx: &ExecContext<'_>) -> Result<u64> {
        let out = self.query(handle, "SELECT pg_current_wal_lsn()", ctx)?;
        parse_lsn(out.trim())
    }

    /// Open a replication session, recreate the slot and return the session
    /// (which keeps the exported snapshot alive), the consistent point and
    /// the snapshot name.
    fn create_slot(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<(InteractiveSession, u64, String)> {
        let slot = Self::slot_name(handle);
        let mut cmd = tool(&self.settings, "psql");
        cmd.arg(replication_conninfo(handle))
            .args(["-X", "--quiet", "--no-align", "--tuples-only"])
            .args(["--field-separator", "|"])
            .env("PGPASSWORD", &handle.credentials.password);
        let mut session = InteractiveSession::spawn(&mut cmd)?;

        // A previous lineage's slot is replaced; errors for a missing slot
        // are reported on stderr and the session carries on.
        session.send(&format!("DROP_REPLICATION_SLOT {slot};"))?;
        session.send(&format!(
            "CREATE_REPLICATION_SLOT {slot} LOGICAL {OUTPUT_PLUGIN} EXPORT_SNAPSHOT;"
        ))?;
        let prefix = format!("{slot}|");
        let line = session.read_until(SLOT_TIMEOUT.min(ctx.timeout), ctx.cancel, |l| {
            l.starts_with(&prefix)
        })?;

        let fields: Vec<&str> = line.split('|').collect();
        let (Some(point), Some(snapshot)) = (fields.get(1), fields.get(2)) else {
            return Err(VaultError::InvalidFormat(format!(
                "unexpected CREATE_REPLICATION_SLOT reply: {line}"
            )));
        };
        Ok((session, parse_lsn(point)?, snapshot.to_string()))
    }

    fn dump_full(&self, req: &DumpRequest<'_>, ctx: &ExecContext<'_>) -> Result<EngineMetadata> {
        let (session, consistent_point, snapshot) = self.create_slot(req.handle, ctx)?;
        let captured_at = Utc::now();
        debug!(
            database = %req.handle.database,
            lsn = %format_lsn(consistent_point),
            snapshot = %snapshot,
            "replication slot created"
        );

        let mut cmd = self.client(req.handle, "pg_dump");
        cmd.arg(format!("--dbname={}", req.handle.database))
            .arg(format!("--snapshot={snapshot}"))
            .arg("--format=custom");
        let dumped = process::run(
            &mut cmd,
            None,
            StdoutTarget::File(req.output),
            ctx.timeout,
            ctx.cancel,
        );
        session.close();
        dumped?;

        let object_count = match self.count_tables_in_archive(req.output, ctx) {
            Ok(n) => Some(n),
            Err(e) => {
                warn!(error = %e, "could not list dump contents");
                None
            }
        };

        Ok(EngineMetadata {
            pitr_capable: true,
            marker: Some(ReplayMarker::new(KIND, format_lsn(consistent_point))),
            captured_at: Some(captured_at),
            object_count,
            extra: [("slot".to_string(), Self::slot_name(req.handle))].into(),
            ..Default::default()
        })
    }

    fn count_tables_in_archive(&self, archive: &Path, ctx: &ExecContext<'_>) -> Result<u64> {
        let mut cmd = tool(&self.settings, "pg_restore");
        cmd.arg("--list").arg(archive);
        let out = process::run(&mut cmd, None, StdoutTarget::Capture, ctx.timeout, ctx.cancel)?;
        Ok(out
            .stdout_text()
            .lines()
            .filter(|l| !l.starts_with(';') && l.contains(" TABLE ") && !l.contains("TABLE DATA"))
            .count() as u64)
    }

    fn dump_incremental(
        &self,
        req: &DumpRequest<'_>,
        since: &ReplayMarker,
        ctx: &ExecContext<'_>,
    ) -> Result<EngineMetadata> {
        let since = parse_lsn(expect_engine(since, KIND)?)?;
        let slot = Self::slot_name(req.handle);

        let exists = self.query(
            req.handle,
            &format!(
                "SELECT count(*) FROM pg_replication_slots WHERE slot_name = {}",
                sql_literal(&slot)
            ),
            ctx,
        )?;
        if parse_count("psql", &exists)? == 0 {
            return Err(VaultError::NoBaseBackup(format!(
                "replication slot {slot} is missing; take a full backup"
            )));
        }

        // Everything up to the parent's marker is safely stored; let the
        // server recycle that WAL.
        let since_lit = sql_literal(&format_lsn(since));
        self.query(
            req.handle,
            &format!(
                "SELECT pg_replication_slot_advance(slot_name, {since_lit}::pg_lsn) \
                 FROM pg_replication_slots WHERE slot_name = {} \
                 AND confirmed_flush_lsn < {since_lit}::pg_lsn",
                sql_literal(&slot)
            ),
            ctx,
        )?;

        let end = self.current_lsn(req.handle, ctx)?;
        let captured_at = Utc::now();

        let raw = sibling_temp(req.output, ".wal2json")?;
        let mut cmd = self.psql(req.handle);
        cmd.args(["--set", "FETCH_COUNT=1000", "--command"]).arg(format!(
            "SELECT data FROM pg_logical_slot_peek_changes({}, {}::pg_lsn, NULL, \
             'format-version', '2', 'include-timestamp', '1', 'include-lsn', '1', \
             'include-types', '1')",
            sql_literal(&slot),
            sql_literal(&format_lsn(end))
        ));
        process::run(
            &mut cmd,
            None,
            StdoutTarget::File(raw.path()),
            ctx.timeout,
            ctx.cancel,
        )?;

        let summary = normalize_wal2json(
            BufReader::new(File::open(raw.path())?),
            since,
            req.output,
        )?;
        debug!(
            database = %req.handle.database,
            entries = summary.entry_count,
            "normalized logical decoding output"
        );

        Ok(EngineMetadata {
            pitr_capable: true,
            marker: Some(ReplayMarker::new(KIND, format_lsn(end))),
            captured_at: Some(captured_at),
            first_entry_at: summary.first_entry_at,
            last_entry_at: summary.last_entry_at,
            entry_count: Some(summary.entry_count),
            extra: [("slot".to_string(), slot)].into(),
            ..Default::default()
        })
    }
}

impl EngineAdapter for WalEngineAdapter {
    fn kind(&self) -> EngineKind {
        KIND
    }

    fn pitr_capable(&self) -> bool {
        true
    }

    fn dump(&self, req: &DumpRequest<'_>, ctx: &ExecContext<'_>) -> Result<EngineMetadata> {
        match (req.backup_type, req.since) {
            (BackupType::Full, _) => self.dump_full(req, ctx),
            (BackupType::Incremental, Some(since)) => self.dump_incremental(req, since, ctx),
            (BackupType::Incremental, None) => Err(VaultError::NoBaseBackup(
                "incremental dump requested without a parent marker".into(),
            )),
        }
    }

    fn read_marker(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<Option<ReplayMarker>> {
        let lsn = self.current_lsn(handle, ctx)?;
        Ok(Some(ReplayMarker::new(KIND, format_lsn(lsn))))
    }

    fn apply_dump(
        &self,
        handle: &DatabaseHandle,
        artifact: &Path,
        _metadata: &EngineMetadata,
        ctx: &ExecContext<'_>,
    ) -> Result<()> {
        info!(database = %handle.database, "restoring pg_dump archive");
        let mut cmd = self.client(handle, "pg_restore");
        cmd.arg(format!("--dbname={}", handle.database))
            .args(["--no-owner", "--clean", "--if-exists", "--exit-on-error"]);
        process::run(
            &mut cmd,
            Some(artifact),
            StdoutTarget::Discard,
            ctx.timeout,
            ctx.cancel,
        )?;
        Ok(())
    }

    fn apply_replay_up_to(
        &self,
        handle: &DatabaseHandle,
        replay: &Path,
        target: Option<DateTime<Utc>>,
        ctx: &ExecContext<'_>,
    ) -> Result<ReplayStats> {
        let script = sibling_temp(replay, ".sql")?;
        let stats = replay_log::render_until(replay, target, script.path(), KIND)?;
        if stats.applied > 0 {
            let mut cmd = self.psql(handle);
            cmd.arg("--file=-");
            process::run(
                &mut cmd,
                Some(script.path()),
                StdoutTarget::Discard,
                ctx.timeout,
                ctx.cancel,
            )?;
        }
        Ok(stats)
    }

    fn compare_markers(&self, a: &ReplayMarker, b: &ReplayMarker) -> Result<Ordering> {
        let a = parse_lsn(expect_engine(a, KIND)?)?;
        let b = parse_lsn(expect_engine(b, KIND)?)?;
        Ok(a.cmp(&b))
    }

    fn ping(&self, handle: &DatabaseHandle, ctx: &ExecContext<'_>) -> Result<()> {
        self.query(handle, "SELECT 1", ctx).map(|_| ())
    }

    fn count_objects(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<Option<u64>> {
        let out = self.query(
            handle,
            "SELECT count(*) FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' \
             AND table_schema NOT IN ('pg_catalog', 'information_schema')",
            ctx,
        )?;
        parse_count("psql", &out).map(Some)
    }
}

fn replication_conninfo(handle: &DatabaseHandle) -> String {
    let mut info = format!(
        "host={} port={} dbname={} replication=database",
        conninfo_value(&handle.host),
        handle.port,
        conninfo_value(&handle.database)
    );
    if !handle.credentials.username.is_empty() {
        let _ = write!(info, " user={}", conninfo_value(&handle.credentials.username));
    }
    info
}

fn conninfo_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

#[derive(Debug, Deserialize)]
struct Change {
    action: String,
    #[serde(default)]
    lsn: Option<String>,
    #[serde(default)]
    nextlsn: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    schema: Option<String>,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    columns: Vec<Column>,
    #[serde(default)]
    identity: Vec<Column>,
}

#[derive(Debug, Deserialize)]
struct Column {
    name: String,
    #[serde(rename = "type", default)]
    type_name: Option<String>,
    value: serde_json::Value,
}

fn parse_wal2json_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%#z")
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| VaultError::InvalidFormat(format!("bad wal2json timestamp '{raw}': {e}")))
}

fn literal(col: &Column) -> String {
    let base = match &col.value {
        serde_json::Value::Null => return "NULL".into(),
        serde_json::Value::Bool(b) => return if *b { "TRUE".into() } else { "FALSE".into() },
        serde_json::Value::Number(n) => sql_literal(&n.to_string()),
        serde_json::Value::String(s) => sql_literal(s),
        other => sql_literal(&other.to_string()),
    };
    match &col.type_name {
        Some(t) => format!("{base}::{t}"),
        None => base,
    }
}

fn qualified(change: &Change) -> Result<String> {
    match (&change.schema, &change.table) {
        (Some(s), Some(t)) => Ok(format!("{}.{}", sql_ident(s), sql_ident(t))),
        _ => Err(VaultError::InvalidFormat(format!(
            "wal2json '{}' record without schema/table",
            change.action
        ))),
    }
}

fn where_clause(identity: &[Column]) -> String {
    identity
        .iter()
        .map(|c| match c.value {
            serde_json::Value::Null => format!("{} IS NULL", sql_ident(&c.name)),
            _ => format!("{} = {}", sql_ident(&c.name), literal(c)),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// SQL for one row change, `None` for records that carry no statement.
fn change_to_sql(change: &Change) -> Result<Option<String>> {
    let sql = match change.action.as_str() {
        "I" => {
            let cols: Vec<String> = change.columns.iter().map(|c| sql_ident(&c.name)).collect();
            let vals: Vec<String> = change.columns.iter().map(literal).collect();
            format!(
                "INSERT INTO {} ({}) VALUES ({});",
                qualified(change)?,
                cols.join(", "),
                vals.join(", ")
            )
        }
        "U" => {
            let sets: Vec<String> = change
                .columns
                .iter()
                .map(|c| format!("{} = {}", sql_ident(&c.name), literal(c)))
                .collect();
            format!(
                "UPDATE {} SET {} WHERE {};",
                qualified(change)?,
                sets.join(", "),
                where_clause(&change.identity)
            )
        }
        "D" => format!(
            "DELETE FROM {} WHERE {};",
            qualified(change)?,
            where_clause(&change.identity)
        ),
        "T" => format!("TRUNCATE {};", qualified(change)?),
        _ => return Ok(None),
    };
    Ok(Some(sql))
}

/// Group wal2json v2 records into transactions and write the ones that
/// committed after `since` as a replay log.
fn normalize_wal2json(input: impl BufRead, since: u64, output: &Path) -> Result<ReplaySummary> {
    let header = ReplayHeader {
        engine: KIND,
        format: FORMAT.into(),
        preamble: "SET client_min_messages = warning;".into(),
        epilogue: String::new(),
    };
    let mut writer = ReplayLogWriter::create(output, &header)?;

    let mut txn: Option<String> = None;
    for (n, line) in input.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let change: Change = serde_json::from_str(line).map_err(|e| {
            VaultError::InvalidFormat(format!("wal2json record {}: {e}", n + 1))
        })?;
        match change.action.as_str() {
            "B" => txn = Some(String::from("BEGIN;\n")),
            "C" => {
                let Some(mut body) = txn.take() else {
                    continue;
                };
                let lsn = change
                    .nextlsn
                    .as_deref()
                    .or(change.lsn.as_deref())
                    .ok_or_else(|| VaultError::InvalidFormat("commit without lsn".into()))?;
                let lsn = parse_lsn(lsn)?;
                if lsn <= since {
                    continue;
                }
                let ts = change.timestamp.as_deref().ok_or_else(|| {
                    VaultError::InvalidFormat("commit without timestamp".into())
                })?;
                body.push_str("COMMIT;");
                writer.append(&ReplayEntry {
                    marker: format_lsn(lsn),
                    committed_at: parse_wal2json_time(ts)?,
                    payload: body,
                })?;
            }
            _ => {
                if let (Some(body), Some(sql)) = (txn.as_mut(), change_to_sql(&change)?) {
                    body.push_str(&sql);
                    body.push('\n');
                }
            }
        }
    }
    Ok(writer.finish()?.1)
}
