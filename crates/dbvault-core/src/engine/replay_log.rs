//! Replay log: the artifact format of every incremental backup.
//!
//! Newline-delimited JSON. The first line is a [`ReplayHeader`]; each further
//! line is one committed transaction ([`ReplayEntry`]) in marker order. The
//! payload is already in the form the engine's client executes, so applying a
//! prefix of the log is `preamble + payloads + epilogue` fed to that client.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ReplayStats;
use crate::error::{Result, VaultError};
use crate::model::EngineKind;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayHeader {
    pub engine: EngineKind,
    /// Native source the entries were normalized from (`binlog`, `wal2json`, ...).
    pub format: String,
    #[serde(default)]
    pub preamble: String,
    #[serde(default)]
    pub epilogue: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayEntry {
    /// Marker token of the position just after this transaction.
    pub marker: String,
    pub committed_at: DateTime<Utc>,
    pub payload: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplaySummary {
    pub entry_count: u64,
    pub first_entry_at: Option<DateTime<Utc>>,
    pub last_entry_at: Option<DateTime<Utc>>,
    pub last_marker: Option<String>,
}

pub struct ReplayLogWriter<W: Write> {
    out: W,
    summary: ReplaySummary,
}

impl ReplayLogWriter<BufWriter<File>> {
    pub fn create(path: &Path, header: &ReplayHeader) -> Result<Self> {
        Self::new(BufWriter::new(File::create(path)?), header)
    }
}

impl<W: Write> ReplayLogWriter<W> {
    pub fn new(mut out: W, header: &ReplayHeader) -> Result<Self> {
        serde_json::to_writer(&mut out, header)?;
        out.write_all(b"\n")?;
        Ok(Self {
            out,
            summary: ReplaySummary::default(),
        })
    }

    /// Entries only; the header is prepended later with [`assemble`].
    pub fn without_header(out: W) -> Self {
        Self {
            out,
            summary: ReplaySummary::default(),
        }
    }

    pub fn append(&mut self, entry: &ReplayEntry) -> Result<()> {
        serde_json::to_writer(&mut self.out, entry)?;
        self.out.write_all(b"\n")?;
        let s = &mut self.summary;
        s.entry_count += 1;
        s.first_entry_at.get_or_insert(entry.committed_at);
        s.last_entry_at = Some(entry.committed_at);
        s.last_marker = Some(entry.marker.clone());
        Ok(())
    }

    pub fn finish(mut self) -> Result<(W, ReplaySummary)> {
        self.out.flush()?;
        Ok((self.out, self.summary))
    }
}

/// Write `header` followed by the entry lines in `body` to `output`.
pub fn assemble(output: &Path, header: &ReplayHeader, body: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(output)?);
    serde_json::to_writer(&mut out, header)?;
    out.write_all(b"\n")?;
    std::io::copy(&mut File::open(body)?, &mut out)?;
    out.flush()?;
    Ok(())
}

pub struct ReplayLogReader<R: BufRead> {
    header: ReplayHeader,
    lines: Lines<R>,
    line_no: usize,
}

impl ReplayLogReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        Self::new(BufReader::new(File::open(path)?))
    }
}

impl<R: BufRead> ReplayLogReader<R> {
    pub fn new(input: R) -> Result<Self> {
        let mut lines = input.lines();
        let first = lines
            .next()
            .transpose()?
            .ok_or_else(|| VaultError::InvalidFormat("replay log is empty".into()))?;
        let header: ReplayHeader = serde_json::from_str(&first)
            .map_err(|e| VaultError::InvalidFormat(format!("replay log header: {e}")))?;
        Ok(Self {
            header,
            lines,
            line_no: 1,
        })
    }

    pub fn header(&self) -> &ReplayHeader {
        &self.header
    }
}

impl<R: BufRead> Iterator for ReplayLogReader<R> {
    type Item = Result<ReplayEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(line) => line,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(serde_json::from_str(&line).map_err(|e| {
                VaultError::InvalidFormat(format!("replay log line {}: {e}", self.line_no))
            }));
        }
    }
}

/// Write the executable prefix of `replay` (entries committed at or before
/// `target`) to `out`, framed by the header's preamble and epilogue.
///
/// Emission stops at the first entry past the target; later entries are
/// counted as skipped even if one carries an earlier timestamp.
pub fn render_until(
    replay: &Path,
    target: Option<DateTime<Utc>>,
    out: &Path,
    engine: EngineKind,
) -> Result<ReplayStats> {
    let mut reader = ReplayLogReader::open(replay)?;
    if reader.header().engine != engine {
        return Err(VaultError::InvalidFormat(format!(
            "replay log for {} given to {engine} adapter",
            reader.header().engine
        )));
    }
    let preamble = reader.header().preamble.clone();
    let epilogue = reader.header().epilogue.clone();

    let mut w = BufWriter::new(File::create(out)?);
    write_block(&mut w, &preamble)?;

    let mut stats = ReplayStats::default();
    let mut past_target = false;
    for entry in reader.by_ref() {
        let entry = entry?;
        if past_target || target.is_some_and(|t| entry.committed_at > t) {
            past_target = true;
            stats.skipped += 1;
            continue;
        }
        write_block(&mut w, &entry.payload)?;
        stats.applied += 1;
        stats.last_applied_at = Some(entry.committed_at);
    }

    write_block(&mut w, &epilogue)?;
    w.flush()?;
    Ok(stats)
}

fn write_block(w: &mut impl Write, block: &str) -> Result<()> {
    if block.is_empty() {
        return Ok(());
    }
    w.write_all(block.as_bytes())?;
    if !block.ends_with('\n') {
        w.write_all(b"\n")?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("replay.ndjson");
        let header = ReplayHeader {
            engine: EngineKind::WalEngine,
            format: "test".into(),
            preamble: "BEGIN_SCRIPT;".into(),
            epilogue: "END_SCRIPT;".into(),
        };
        let mut w = ReplayLogWriter::create(&path, &header).unwrap();
        for (i, t) in [10, 20, 30].into_iter().enumerate() {
            w.append(&ReplayEntry {
                marker: format!("{}", i + 1),
                committed_at: at(t),
                payload: format!("stmt {t};"),
            })
            .unwrap();
        }
        let (_, summary) = w.finish().unwrap();
        assert_eq!(summary.entry_count, 3);
        assert_eq!(summary.first_entry_at, Some(at(10)));
        assert_eq!(summary.last_entry_at, Some(at(30)));
        assert_eq!(summary.last_marker.as_deref(), Some("3"));
        path
    }

    #[test]
    fn render_stops_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample(dir.path());
        let out = dir.path().join("script.sql");

        let stats = render_until(&log, Some(at(25)), &out, EngineKind::WalEngine).unwrap();
        assert_eq!(stats.applied, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.last_applied_at, Some(at(20)));
        let script = std::fs::read_to_string(&out).unwrap();
        assert_eq!(script, "BEGIN_SCRIPT;\nstmt 10;\nstmt 20;\nEND_SCRIPT;\n");
    }

    #[test]
    fn render_includes_entry_exactly_at_target() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample(dir.path());
        let out = dir.path().join("script.sql");
        let stats = render_until(&log, Some(at(20)), &out, EngineKind::WalEngine).unwrap();
        assert_eq!(stats.applied, 2);
    }

    #[test]
    fn render_without_target_applies_everything() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample(dir.path());
        let out = dir.path().join("script.sql");
        let stats = render_until(&log, None, &out, EngineKind::WalEngine).unwrap();
        assert_eq!(stats.applied, 3);
        assert_eq!(stats.skipped, 0);
    }

    #[test]
    fn render_rejects_foreign_engine() {
        let dir = tempfile::tempdir().unwrap();
        let log = sample(dir.path());
        let out = dir.path().join("script.sql");
        assert!(render_until(&log, None, &out, EngineKind::RowStore).is_err());
    }

    #[test]
    fn reader_rejects_garbage_header() {
        let err = ReplayLogReader::new("not json\n".as_bytes()).err().unwrap();
        assert!(matches!(err, VaultError::InvalidFormat(_)));
    }
}
