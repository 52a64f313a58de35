//! MongoDB-compatible document store: archive dumps with their own oplog
//! slice for fulls, exported oplog ranges for incrementals.
//!
//! The full's marker is read strictly before `mongodump` starts. Oplog
//! entries between that marker and the end of the dump are applied twice on
//! restore (once by `--oplogReplay`, once from the first incremental), which
//! is harmless because oplog application is idempotent.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::{debug, info};

use super::replay_log::{self, ReplayEntry, ReplayHeader, ReplayLogWriter, ReplaySummary};
use super::{
    DumpRequest, EngineAdapter, ExecContext, ReplayStats, expect_engine, parse_count,
    sibling_temp, tool,
};
use crate::config::EngineSettings;
use crate::error::{Result, VaultError};
use crate::model::{BackupType, DatabaseHandle, EngineKind, EngineMetadata, ReplayMarker};
use crate::platform::process::{self, StdoutTarget};

const KIND: EngineKind = EngineKind::DocumentStore;
const FORMAT: &str = "oplog";

const APPLY_PREAMBLE: &str = r#"const __admin = db.getSiblingDB("admin");
function __apply(op) {
  const res = __admin.runCommand({ applyOps: [op] });
  if (!res.ok) { throw new Error("applyOps failed: " + JSON.stringify(res)); }
}"#;

/// Oplog timestamp `seconds:increment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OplogTimestamp {
    pub t: u32,
    pub i: u32,
}

impl OplogTimestamp {
    pub fn parse(token: &str) -> Result<Self> {
        let bad = || VaultError::InvalidFormat(format!("bad oplog timestamp '{token}'"));
        let (t, i) = token.trim().split_once(':').ok_or_else(bad)?;
        Ok(Self {
            t: t.parse().map_err(|_| bad())?,
            i: i.parse().map_err(|_| bad())?,
        })
    }

    pub fn token(self) -> String {
        format!("{}:{}", self.t, self.i)
    }

    /// Canonical extended JSON, as used in export queries.
    fn ejson(self) -> String {
        format!(r#"{{"$timestamp":{{"t":{},"i":{}}}}}"#, self.t, self.i)
    }

    fn from_ejson(value: &Value) -> Option<Self> {
        let ts = value.get("$timestamp")?;
        Some(Self {
            t: u32::try_from(ts.get("t")?.as_u64()?).ok()?,
            i: u32::try_from(ts.get("i")?.as_u64()?).ok()?,
        })
    }
}

pub struct DocumentStoreAdapter {
    settings: EngineSettings,
}

impl DocumentStoreAdapter {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    /// Database tools read the password from a private config file so it
    /// never appears in argv.
    fn tools_command(
        &self,
        handle: &DatabaseHandle,
        name: &str,
        anchor: &Path,
    ) -> Result<(Command, Option<tempfile::NamedTempFile>)> {
        let mut cmd = tool(&self.settings, name);
        cmd.arg(format!("--host={}", handle.host))
            .arg(format!("--port={}", handle.port));
        let mut secret = None;
        if !handle.credentials.username.is_empty() {
            cmd.arg(format!("--username={}", handle.credentials.username))
                .arg("--authenticationDatabase=admin");
            let mut file = sibling_temp(anchor, ".yaml")?;
            writeln!(
                file,
                "password: {}",
                serde_json::to_string(&handle.credentials.password)?
            )?;
            file.flush()?;
            cmd.arg(format!("--config={}", file.path().display()));
            secret = Some(file);
        }
        Ok((cmd, secret))
    }

    /// `mongosh` has no password file option; the password is passed on its
    /// command line.
    fn eval(&self, handle: &DatabaseHandle, script: &str, ctx: &ExecContext<'_>) -> Result<String> {
        let mut cmd = tool(&self.settings, "mongosh");
        cmd.arg("--quiet")
            .arg(format!("--host={}", handle.host))
            .arg(format!("--port={}", handle.port));
        if !handle.credentials.username.is_empty() {
            cmd.arg(format!("--username={}", handle.credentials.username))
                .arg(format!("--password={}", handle.credentials.password))
                .arg("--authenticationDatabase=admin");
        }
        cmd.arg("--eval").arg(script);
        let out = process::run(&mut cmd, None, StdoutTarget::Capture, ctx.timeout, ctx.cancel)?;
        Ok(out.stdout_text())
    }

    fn newest_oplog_ts(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<OplogTimestamp> {
        let out = self.eval(
            handle,
            r#"const e = db.getSiblingDB("local").oplog.rs.find({}, {ts: 1}).sort({$natural: -1}).limit(1).next();
print(e.ts.t + ":" + e.ts.i);"#,
            ctx,
        )?;
        let line = out
            .lines()
            .map(str::trim)
            .rfind(|l| !l.is_empty())
            .ok_or_else(|| VaultError::InvalidFormat("mongosh printed no oplog timestamp".into()))?;
        OplogTimestamp::parse(line)
    }

    fn dump_full(&self, req: &DumpRequest<'_>, ctx: &ExecContext<'_>) -> Result<EngineMetadata> {
        let marker = self.newest_oplog_ts(req.handle, ctx)?;

        let (mut cmd, _secret) = self.tools_command(req.handle, "mongodump", req.output)?;
        cmd.arg(format!("--archive={}", req.output.display()))
            .arg("--oplog");
        process::run(&mut cmd, None, StdoutTarget::Discard, ctx.timeout, ctx.cancel)?;

        Ok(EngineMetadata {
            pitr_capable: true,
            marker: Some(ReplayMarker::new(KIND, marker.token())),
            // The archive reflects the end of the dump, not the marker.
            captured_at: Some(Utc::now()),
            ..Default::default()
        })
    }

    fn dump_incremental(
        &self,
        req: &DumpRequest<'_>,
        since: &ReplayMarker,
        ctx: &ExecContext<'_>,
    ) -> Result<EngineMetadata> {
        let since = OplogTimestamp::parse(expect_engine(since, KIND)?)?;
        let end = self.newest_oplog_ts(req.handle, ctx)?;
        let captured_at = Utc::now();

        let raw = sibling_temp(req.output, ".oplog.json")?;
        let (mut cmd, _secret) = self.tools_command(req.handle, "mongoexport", req.output)?;
        let query = format!(
            r#"{{"ts":{{"$gt":{},"$lte":{}}},"op":{{"$ne":"n"}},"ns":{{"$regex":"^{}\\."}}}}"#,
            since.ejson(),
            end.ejson(),
            regex_escape(&req.handle.database)
        );
        cmd.args(["--db=local", "--collection=oplog.rs", "--jsonFormat=canonical"])
            .arg(format!("--query={query}"))
            .arg(format!("--out={}", raw.path().display()));
        process::run(&mut cmd, None, StdoutTarget::Discard, ctx.timeout, ctx.cancel)?;

        let summary = normalize_oplog(BufReader::new(File::open(raw.path())?), since, req.output)?;
        debug!(
            database = %req.handle.database,
            entries = summary.entry_count,
            "normalized oplog export"
        );

        Ok(EngineMetadata {
            pitr_capable: true,
            marker: Some(ReplayMarker::new(KIND, end.token())),
            captured_at: Some(captured_at),
            first_entry_at: summary.first_entry_at,
            last_entry_at: summary.last_entry_at,
            entry_count: Some(summary.entry_count),
            ..Default::default()
        })
    }
}

impl EngineAdapter for DocumentStoreAdapter {
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
        let ts = self.newest_oplog_ts(handle, ctx)?;
        Ok(Some(ReplayMarker::new(KIND, ts.token())))
    }

    fn apply_dump(
        &self,
        handle: &DatabaseHandle,
        artifact: &Path,
        _metadata: &EngineMetadata,
        ctx: &ExecContext<'_>,
    ) -> Result<()> {
        info!(database = %handle.database, "restoring mongodump archive");
        let (mut cmd, _secret) = self.tools_command(handle, "mongorestore", artifact)?;
        cmd.arg(format!("--archive={}", artifact.display()))
            .args(["--oplogReplay", "--drop"]);
        process::run(&mut cmd, None, StdoutTarget::Discard, ctx.timeout, ctx.cancel)?;
        Ok(())
    }

    fn apply_replay_up_to(
        &self,
        handle: &DatabaseHandle,
        replay: &Path,
        target: Option<DateTime<Utc>>,
        ctx: &ExecContext<'_>,
    ) -> Result<ReplayStats> {
        let script = sibling_temp(replay, ".js")?;
        let stats = replay_log::render_until(replay, target, script.path(), KIND)?;
        if stats.applied > 0 {
            let mut cmd = tool(&self.settings, "mongosh");
            cmd.arg("--quiet")
                .arg(format!("--host={}", handle.host))
                .arg(format!("--port={}", handle.port));
            if !handle.credentials.username.is_empty() {
                cmd.arg(format!("--username={}", handle.credentials.username))
                    .arg(format!("--password={}", handle.credentials.password))
                    .arg("--authenticationDatabase=admin");
            }
            cmd.arg("--file").arg(script.path());
            process::run(&mut cmd, None, StdoutTarget::Discard, ctx.timeout, ctx.cancel)?;
        }
        Ok(stats)
    }

    fn compare_markers(&self, a: &ReplayMarker, b: &ReplayMarker) -> Result<Ordering> {
        let a = OplogTimestamp::parse(expect_engine(a, KIND)?)?;
        let b = OplogTimestamp::parse(expect_engine(b, KIND)?)?;
        Ok(a.cmp(&b))
    }

    fn ping(&self, handle: &DatabaseHandle, ctx: &ExecContext<'_>) -> Result<()> {
        let out = self.eval(handle, "print(db.runCommand({ping: 1}).ok)", ctx)?;
        match out.trim() {
            "1" => Ok(()),
            other => Err(VaultError::EngineUnreachable(format!(
                "ping answered '{other}'"
            ))),
        }
    }

    fn count_objects(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<Option<u64>> {
        let script = format!(
            "print(db.getSiblingDB({}).getCollectionNames().length)",
            serde_json::to_string(&handle.database)?
        );
        let out = self.eval(handle, &script, ctx)?;
        parse_count("mongosh", &out).map(Some)
    }
}

fn regex_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if "\\.^$|?*+()[]{}".contains(c) {
            // Inside a JSON string a regex backslash is itself escaped.
            out.push_str("\\\\");
        }
        out.push(c);
    }
    out
}

/// Oplog entry's wall clock, falling back to the timestamp's seconds.
fn entry_time(doc: &Value, ts: OplogTimestamp) -> Option<DateTime<Utc>> {
    let wall_ms = doc
        .get("wall")
        .and_then(|w| w.get("$date"))
        .and_then(|d| d.get("$numberLong"))
        .and_then(Value::as_str)
        .and_then(|s| s.parse::<i64>().ok());
    match wall_ms {
        Some(ms) => Utc.timestamp_millis_opt(ms).single(),
        None => Utc.timestamp_opt(i64::from(ts.t), 0).single(),
    }
}

/// Turn exported oplog documents into `applyOps` calls.
fn normalize_oplog(input: impl BufRead, since: OplogTimestamp, output: &Path) -> Result<ReplaySummary> {
    let header = ReplayHeader {
        engine: KIND,
        format: FORMAT.into(),
        preamble: APPLY_PREAMBLE.into(),
        epilogue: String::new(),
    };
    let mut writer = ReplayLogWriter::create(output, &header)?;
    let mut last: Option<OplogTimestamp> = None;

    for (n, line) in input.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let doc: Value = serde_json::from_str(line)
            .map_err(|e| VaultError::InvalidFormat(format!("oplog document {}: {e}", n + 1)))?;
        let ts = doc.get("ts").and_then(OplogTimestamp::from_ejson).ok_or_else(|| {
            VaultError::InvalidFormat(format!("oplog document {} has no ts", n + 1))
        })?;
        if ts <= since {
            continue;
        }
        if last.is_some_and(|prev| ts <= prev) {
            return Err(VaultError::InvalidFormat(format!(
                "oplog export out of order at {}",
                ts.token()
            )));
        }
        last = Some(ts);

        let committed_at = entry_time(&doc, ts).ok_or_else(|| {
            VaultError::InvalidFormat(format!("oplog document {} has a bad wall time", n + 1))
        })?;
        writer.append(&ReplayEntry {
            marker: ts.token(),
            committed_at,
            payload: format!("__apply(EJSON.parse({}));", serde_json::to_string(line)?),
        })?;
    }
    Ok(writer.finish()?.1)
}
