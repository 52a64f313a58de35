//! MySQL-compatible row store: `mysqldump` for fulls, binary log segments
//! read with `mysqlbinlog` for incrementals.

use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter};
use std::path::Path;
use std::process::Command;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, info};

use super::replay_log::{self, ReplayEntry, ReplayHeader, ReplayLogWriter, ReplaySummary};
use super::{
    DumpRequest, EngineAdapter, ExecContext, ReplayStats, expect_engine, parse_count,
    sibling_temp, sql_literal, tool,
};
use crate::config::EngineSettings;
use crate::error::{Result, VaultError};
use crate::model::{BackupType, DatabaseHandle, EngineKind, EngineMetadata, ReplayMarker};
use crate::platform::process::{self, StdoutTarget};

const KIND: EngineKind = EngineKind::RowStore;
const FORMAT: &str = "mysqlbinlog";

/// Binary log coordinates, ordered by file sequence number then offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinlogPosition {
    pub file: String,
    pub seq: u64,
    pub pos: u64,
}

impl BinlogPosition {
    pub fn new(file: &str, pos: u64) -> Result<Self> {
        let seq = file
            .rsplit_once('.')
            .and_then(|(_, n)| n.parse().ok())
            .ok_or_else(|| {
                VaultError::InvalidFormat(format!("binary log name '{file}' has no sequence"))
            })?;
        Ok(Self {
            file: file.to_string(),
            seq,
            pos,
        })
    }

    pub fn parse(token: &str) -> Result<Self> {
        let (file, pos) = token.rsplit_once(':').ok_or_else(|| {
            VaultError::InvalidFormat(format!("binlog marker '{token}' is not file:position"))
        })?;
        let pos = pos
            .parse()
            .map_err(|_| VaultError::InvalidFormat(format!("bad binlog position in '{token}'")))?;
        Self::new(file, pos)
    }

    pub fn token(&self) -> String {
        format!("{}:{}", self.file, self.pos)
    }

    fn key(&self) -> (u64, u64) {
        (self.seq, self.pos)
    }
}

pub struct RowStoreAdapter {
    settings: EngineSettings,
}

impl RowStoreAdapter {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    fn client(&self, handle: &DatabaseHandle, name: &str) -> Command {
        let mut cmd = tool(&self.settings, name);
        cmd.arg(format!("--host={}", handle.host))
            .arg(format!("--port={}", handle.port));
        if !handle.credentials.username.is_empty() {
            cmd.arg(format!("--user={}", handle.credentials.username));
        }
        cmd.env("MYSQL_PWD", &handle.credentials.password);
        cmd
    }

    fn query(&self, handle: &DatabaseHandle, sql: &str, ctx: &ExecContext<'_>) -> Result<String> {
        let mut cmd = self.client(handle, "mysql");
        cmd.args(["--batch", "--skip-column-names", "--execute"])
            .arg(sql);
        let out = process::run(&mut cmd, None, StdoutTarget::Capture, ctx.timeout, ctx.cancel)?;
        Ok(out.stdout_text())
    }

    fn current_position(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<Option<BinlogPosition>> {
        let out = self.query(handle, "SHOW MASTER STATUS", ctx)?;
        let Some(line) = out.lines().find(|l| !l.trim().is_empty()) else {
            return Ok(None);
        };
        let mut cols = line.split('\t');
        match (cols.next(), cols.next().and_then(|p| p.trim().parse().ok())) {
            (Some(file), Some(pos)) => Ok(Some(BinlogPosition::new(file.trim(), pos)?)),
            _ => Err(VaultError::InvalidFormat(format!(
                "unexpected SHOW MASTER STATUS output: {line}"
            ))),
        }
    }

    fn dump_full(&self, req: &DumpRequest<'_>, ctx: &ExecContext<'_>) -> Result<EngineMetadata> {
        let binlog_enabled = self.current_position(req.handle, ctx)?.is_some();

        let mut cmd = self.client(req.handle, "mysqldump");
        cmd.args([
            "--single-transaction",
            "--routines",
            "--triggers",
            "--events",
            "--hex-blob",
        ]);
        if binlog_enabled {
            // Coordinates of the snapshot are written as a comment in the header.
            cmd.arg("--source-data=2");
        }
        cmd.arg("--databases").arg(&req.handle.database);

        let captured_at = Utc::now();
        process::run(
            &mut cmd,
            None,
            StdoutTarget::File(req.output),
            ctx.timeout,
            ctx.cancel,
        )?;

        let scan = scan_dump(req.output)?;
        if binlog_enabled && scan.position.is_none() {
            return Err(VaultError::InvalidFormat(
                "mysqldump output carries no binary log coordinates".into(),
            ));
        }
        Ok(EngineMetadata {
            pitr_capable: scan.position.is_some(),
            marker: scan
                .position
                .map(|p| ReplayMarker::new(KIND, p.token())),
            captured_at: Some(captured_at),
            object_count: Some(scan.tables),
            ..Default::default()
        })
    }

    fn dump_incremental(
        &self,
        req: &DumpRequest<'_>,
        since: &ReplayMarker,
        ctx: &ExecContext<'_>,
    ) -> Result<EngineMetadata> {
        let since = BinlogPosition::parse(expect_engine(since, KIND)?)?;
        let end = self.current_position(req.handle, ctx)?.ok_or_else(|| {
            VaultError::UnsupportedOperation("binary logging is disabled on the server".into())
        })?;
        let captured_at = Utc::now();

        let summary = if end.key() <= since.key() {
            let w = ReplayLogWriter::create(req.output, &empty_header())?;
            w.finish()?.1
        } else {
            let files = self.logs_between(req.handle, &since, &end, ctx)?;
            let raw = sibling_temp(req.output, ".binlog")?;

            let mut cmd = self.client(req.handle, "mysqlbinlog");
            cmd.arg("--read-from-remote-server")
                .arg(format!("--start-position={}", since.pos))
                .arg(format!("--stop-position={}", end.pos))
                .args(&files);
            process::run(
                &mut cmd,
                None,
                StdoutTarget::File(raw.path()),
                ctx.timeout,
                ctx.cancel,
            )?;
            normalize_binlog(
                BufReader::new(File::open(raw.path())?),
                &since.file,
                req.output,
            )?
        };
        debug!(
            database = %req.handle.database,
            entries = summary.entry_count,
            "normalized binary log segment"
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

    /// Binary log files from `since` through `end`, in sequence order.
    fn logs_between(
        &self,
        handle: &DatabaseHandle,
        since: &BinlogPosition,
        end: &BinlogPosition,
        ctx: &ExecContext<'_>,
    ) -> Result<Vec<String>> {
        let out = self.query(handle, "SHOW BINARY LOGS", ctx)?;
        let mut files = Vec::new();
        for line in out.lines() {
            let Some(name) = line.split('\t').next().map(str::trim) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            let seq = BinlogPosition::new(name, 0)?.seq;
            if (since.seq..=end.seq).contains(&seq) {
                files.push((seq, name.to_string()));
            }
        }
        files.sort();
        if files.first().map(|(seq, _)| *seq) != Some(since.seq) {
            return Err(VaultError::NoBaseBackup(format!(
                "binary log {} is no longer on the server; take a full backup",
                since.file
            )));
        }
        Ok(files.into_iter().map(|(_, name)| name).collect())
    }

    fn pipe_into_client(
        &self,
        handle: &DatabaseHandle,
        script: &Path,
        ctx: &ExecContext<'_>,
    ) -> Result<()> {
        let mut cmd = self.client(handle, "mysql");
        cmd.arg("--binary-mode");
        process::run(
            &mut cmd,
            Some(script),
            StdoutTarget::Discard,
            ctx.timeout,
            ctx.cancel,
        )?;
        Ok(())
    }
}

impl EngineAdapter for RowStoreAdapter {
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
        Ok(self
            .current_position(handle, ctx)?
            .map(|p| ReplayMarker::new(KIND, p.token())))
    }

    fn apply_dump(
        &self,
        handle: &DatabaseHandle,
        artifact: &Path,
        _metadata: &EngineMetadata,
        ctx: &ExecContext<'_>,
    ) -> Result<()> {
        info!(database = %handle.database, "loading mysqldump artifact");
        self.pipe_into_client(handle, artifact, ctx)
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
            self.pipe_into_client(handle, script.path(), ctx)?;
        }
        Ok(stats)
    }

    fn compare_markers(&self, a: &ReplayMarker, b: &ReplayMarker) -> Result<Ordering> {
        let a = BinlogPosition::parse(expect_engine(a, KIND)?)?;
        let b = BinlogPosition::parse(expect_engine(b, KIND)?)?;
        Ok(a.key().cmp(&b.key()))
    }

    fn ping(&self, handle: &DatabaseHandle, ctx: &ExecContext<'_>) -> Result<()> {
        self.query(handle, "SELECT 1", ctx).map(|_| ())
    }

    fn count_objects(
        &self,
        handle: &DatabaseHandle,
        ctx: &ExecContext<'_>,
    ) -> Result<Option<u64>> {
        let sql = format!(
            "SELECT COUNT(*) FROM information_schema.tables WHERE table_schema = {}",
            sql_literal(&handle.database)
        );
        let out = self.query(handle, &sql, ctx)?;
        parse_count("mysql", &out).map(Some)
    }
}

fn empty_header() -> ReplayHeader {
    ReplayHeader {
        engine: KIND,
        format: FORMAT.into(),
        preamble: String::new(),
        epilogue: String::new(),
    }
}

struct DumpScan {
    position: Option<BinlogPosition>,
    tables: u64,
}

/// Pull the snapshot coordinates out of the dump header and count tables.
fn scan_dump(path: &Path) -> Result<DumpScan> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut buf = Vec::new();
    let mut scan = DumpScan {
        position: None,
        tables: 0,
    };
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if buf.starts_with(b"CREATE TABLE ") {
            scan.tables += 1;
        } else if scan.position.is_none() && buf.starts_with(b"-- CHANGE ") {
            let line = String::from_utf8_lossy(&buf);
            scan.position = parse_change_source(&line)?;
        }
    }
    Ok(scan)
}

/// Parse `CHANGE MASTER TO MASTER_LOG_FILE='f', MASTER_LOG_POS=n` or its
/// `CHANGE REPLICATION SOURCE TO SOURCE_LOG_FILE=...` spelling.
fn parse_change_source(line: &str) -> Result<Option<BinlogPosition>> {
    let file = ["MASTER_LOG_FILE='", "SOURCE_LOG_FILE='"]
        .iter()
        .find_map(|key| {
            let start = line.find(key)? + key.len();
            let len = line[start..].find('\'')?;
            Some(&line[start..start + len])
        });
    let pos = ["MASTER_LOG_POS=", "SOURCE_LOG_POS="].iter().find_map(|key| {
        let start = line.find(key)? + key.len();
        let digits: String = line[start..]
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        digits.parse::<u64>().ok()
    });
    match (file, pos) {
        (Some(file), Some(pos)) => BinlogPosition::new(file, pos).map(Some),
        _ => Ok(None),
    }
}

/// Splits `mysqlbinlog` text output into committed transactions.
struct BinlogNormalizer<W: std::io::Write> {
    writer: ReplayLogWriter<W>,
    file: String,
    pending: String,
    in_txn: bool,
    last_timestamp: Option<DateTime<Utc>>,
}

impl<W: std::io::Write> BinlogNormalizer<W> {
    fn handle_event(&mut self, lines: &[String]) -> Result<()> {
        let header = lines.iter().skip(1).find(|l| l.contains("end_log_pos"));
        let end_pos = header.and_then(|h| field_after(h, "end_log_pos "));
        let header_time = header.and_then(|h| parse_header_time(h));

        for line in lines {
            if let Some(ts) = parse_set_timestamp(line) {
                self.last_timestamp = Some(ts);
            }
            self.pending.push_str(line);
            self.pending.push('\n');
        }

        let Some(header) = header else {
            return Ok(());
        };
        if let Some(next) = header.split("Rotate to ").nth(1) {
            if let Some(name) = next.split_whitespace().next() {
                self.file = name.to_string();
            }
            return Ok(());
        }

        let statement = lines
            .iter()
            .skip(2)
            .map(|l| l.trim())
            .find(|l| {
                !l.is_empty()
                    && !l.starts_with('#')
                    && !l.starts_with("SET ")
                    && !l.starts_with("use ")
                    && !l.starts_with("/*!")
            })
            .unwrap_or("");

        let is_xid = header.contains("Xid = ");
        let is_query = header.contains("\tQuery\t");
        let ends_txn = if is_xid || (is_query && statement.starts_with("COMMIT")) {
            true
        } else if is_query && statement.starts_with("BEGIN") {
            self.in_txn = true;
            false
        } else {
            // Statements outside BEGIN/COMMIT (DDL) commit on their own.
            is_query && !self.in_txn && !statement.is_empty()
        };

        if ends_txn {
            let pos = end_pos.ok_or_else(|| {
                VaultError::InvalidFormat(format!("binlog event without end_log_pos: {header}"))
            })?;
            let committed_at = self.last_timestamp.or(header_time).ok_or_else(|| {
                VaultError::InvalidFormat(format!("binlog event without timestamp: {header}"))
            })?;
            self.writer.append(&ReplayEntry {
                marker: format!("{}:{pos}", self.file),
                committed_at,
                payload: std::mem::take(&mut self.pending),
            })?;
            self.in_txn = false;
        }
        Ok(())
    }
}

/// Convert raw `mysqlbinlog` output to a replay log at `output`.
///
/// Text before the first event is the preamble; whatever follows the last
/// committed transaction (trailing rotate events, `DELIMITER ;`, session
/// resets) becomes the epilogue.
fn normalize_binlog(
    mut input: impl BufRead,
    start_file: &str,
    output: &Path,
) -> Result<ReplaySummary> {
    // The epilogue is only known at the end, so entries go to a side file
    // and the header is prepended afterwards.
    let body = sibling_temp(output, ".body")?;
    let mut norm = BinlogNormalizer {
        writer: ReplayLogWriter::without_header(BufWriter::new(body.reopen()?)),
        file: start_file.to_string(),
        pending: String::new(),
        in_txn: false,
        last_timestamp: None,
    };

    let mut preamble = String::new();
    let mut seen_event = false;
    let mut event: Vec<String> = Vec::new();
    let mut trailer: Vec<String> = Vec::new();
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if input.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\n', '\r'])
            .to_string();

        if line.starts_with("# at ") {
            seen_event = true;
            if !event.is_empty() {
                norm.handle_event(&std::mem::take(&mut event))?;
            }
            // A trailer followed by more events belongs to the stream.
            for t in trailer.drain(..) {
                norm.pending.push_str(&t);
                norm.pending.push('\n');
            }
            event.push(line);
        } else if !seen_event {
            preamble.push_str(&line);
            preamble.push('\n');
        } else if line.starts_with("DELIMITER ;") || !trailer.is_empty() {
            if !event.is_empty() {
                norm.handle_event(&std::mem::take(&mut event))?;
            }
            trailer.push(line);
        } else {
            event.push(line);
        }
    }
    if !event.is_empty() {
        norm.handle_event(&event)?;
    }

    let mut epilogue = std::mem::take(&mut norm.pending);
    epilogue.push_str(&trailer.join("\n"));
    let (_, summary) = norm.writer.finish()?;

    let header = ReplayHeader {
        engine: KIND,
        format: FORMAT.into(),
        preamble,
        epilogue,
    };
    replay_log::assemble(output, &header, body.path())?;
    Ok(summary)
}

fn field_after(line: &str, key: &str) -> Option<u64> {
    let start = line.find(key)? + key.len();
    let digits: String = line[start..]
        .chars()
        .skip_while(|c| *c == ' ')
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok()
}

/// `SET TIMESTAMP=1704110405/*!*/;` or with a fractional part.
fn parse_set_timestamp(line: &str) -> Option<DateTime<Utc>> {
    let rest = line.strip_prefix("SET TIMESTAMP=")?;
    let value: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let (secs, frac) = value.split_once('.').unwrap_or((&value, ""));
    let secs: i64 = secs.parse().ok()?;
    let micros: u32 = if frac.is_empty() {
        0
    } else {
        format!("{frac:0<6}")[..6].parse().ok()?
    };
    Utc.timestamp_opt(secs, micros * 1000).single()
}

/// Event header time, `#240101 12:00:05 server id ...`, read as UTC.
fn parse_header_time(header: &str) -> Option<DateTime<Utc>> {
    let stamp = header.strip_prefix('#')?.get(..15)?;
    NaiveDateTime::parse_from_str(stamp, "%y%m%d %H:%M:%S")
        .ok()
        .map(|t| t.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::replay_log::ReplayLogReader;

    const SAMPLE: &str = "\
/*!50530 SET @@SESSION.PSEUDO_SLAVE_MODE=1*/;
DELIMITER /*!*/;
# at 4
#240101 12:00:00 server id 1  end_log_pos 126 CRC32 0x0a0b0c0d \tStart: binlog v 4, server v 8.0.36 created 240101 12:00:00
BINLOG '
AAAA
'/*!*/;
# at 157
#240101 12:00:05 server id 1  end_log_pos 236 CRC32 0x11111111 \tAnonymous_GTID\tlast_committed=0
SET @@SESSION.GTID_NEXT= 'ANONYMOUS'/*!*/;
# at 236
#240101 12:00:05 server id 1  end_log_pos 323 CRC32 0x22222222 \tQuery\tthread_id=8\texec_time=0\terror_code=0
SET TIMESTAMP=1704110405/*!*/;
BEGIN
/*!*/;
# at 323
#240101 12:00:05 server id 1  end_log_pos 400 CRC32 0x33333333 \tWrite_rows: table id 90 flags: STMT_END_F
BINLOG '
BBBB
'/*!*/;
# at 400
#240101 12:00:05 server id 1  end_log_pos 431 CRC32 0x44444444 \tXid = 25
COMMIT/*!*/;
# at 431
#240101 12:00:09 server id 1  end_log_pos 510 CRC32 0x55555555 \tQuery\tthread_id=8\texec_time=0\terror_code=0
use `shop`/*!*/;
SET TIMESTAMP=1704110409/*!*/;
CREATE TABLE t2 (id int)
/*!*/;
# at 510
#240101 12:00:10 server id 1  end_log_pos 557 CRC32 0x66666666 \tRotate to binlog.000008  pos: 4
SET @@SESSION.GTID_NEXT= 'AUTOMATIC' /* added by mysqlbinlog */ /*!*/;
DELIMITER ;
# End of log file
/*!50530 SET @@SESSION.PSEUDO_SLAVE_MODE=0*/;
";

    #[test]
    fn marker_ordering_uses_file_sequence() {
        let adapter = RowStoreAdapter::new(EngineSettings::default());
        let a = ReplayMarker::new(KIND, "binlog.000009:4");
        let b = ReplayMarker::new(KIND, "binlog.000010:4");
        let c = ReplayMarker::new(KIND, "binlog.000010:900");
        assert_eq!(adapter.compare_markers(&a, &b).unwrap(), Ordering::Less);
        assert_eq!(adapter.compare_markers(&c, &b).unwrap(), Ordering::Greater);
        assert_eq!(adapter.compare_markers(&b, &b).unwrap(), Ordering::Equal);
        assert!(BinlogPosition::parse("nocolon").is_err());
    }

    #[test]
    fn change_source_comment_is_parsed_in_both_spellings() {
        let legacy = "-- CHANGE MASTER TO MASTER_LOG_FILE='mysql-bin.000003', MASTER_LOG_POS=154;";
        let p = parse_change_source(legacy).unwrap().unwrap();
        assert_eq!((p.file.as_str(), p.seq, p.pos), ("mysql-bin.000003", 3, 154));

        let modern =
            "-- CHANGE REPLICATION SOURCE TO SOURCE_LOG_FILE='binlog.000012', SOURCE_LOG_POS=8841;";
        let p = parse_change_source(modern).unwrap().unwrap();
        assert_eq!(p.token(), "binlog.000012:8841");
    }

    #[test]
    fn dump_scan_counts_tables() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.sql");
        std::fs::write(
            &path,
            "-- MySQL dump\n-- CHANGE MASTER TO MASTER_LOG_FILE='bin.000002', MASTER_LOG_POS=77;\n\
             CREATE TABLE `a` (id int);\nINSERT INTO `a` VALUES (1);\nCREATE TABLE `b` (id int);\n",
        )
        .unwrap();
        let scan = scan_dump(&path).unwrap();
        assert_eq!(scan.tables, 2);
        assert_eq!(scan.position.unwrap().token(), "bin.000002:77");
    }

    #[test]
    fn binlog_output_splits_into_transactions() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("replay.ndjson");
        let summary = normalize_binlog(SAMPLE.as_bytes(), "binlog.000007", &out).unwrap();
        assert_eq!(summary.entry_count, 2);

        let reader = ReplayLogReader::open(&out).unwrap();
        let header = reader.header().clone();
        assert!(header.preamble.contains("DELIMITER /*!*/;"));
        assert!(header.epilogue.contains("DELIMITER ;"));
        assert!(header.epilogue.contains("Rotate to binlog.000008"));

        let entries: Vec<ReplayEntry> = reader.map(|e| e.unwrap()).collect();
        assert_eq!(entries[0].marker, "binlog.000007:431");
        assert_eq!(entries[0].committed_at.timestamp(), 1_704_110_405);
        assert!(entries[0].payload.contains("BEGIN"));
        assert!(entries[0].payload.contains("COMMIT/*!*/;"));
        // The format description event travels with the first transaction.
        assert!(entries[0].payload.contains("AAAA"));

        assert_eq!(entries[1].marker, "binlog.000007:510");
        assert_eq!(entries[1].committed_at.timestamp(), 1_704_110_409);
        assert!(entries[1].payload.contains("CREATE TABLE t2"));
    }

    #[test]
    fn set_timestamp_accepts_fractions() {
        let t = parse_set_timestamp("SET TIMESTAMP=1704110405.250000/*!*/;").unwrap();
        assert_eq!(t.timestamp(), 1_704_110_405);
        assert_eq!(t.timestamp_subsec_micros(), 250_000);
        assert!(parse_set_timestamp("SET @@session.x=1").is_none());
    }
}
