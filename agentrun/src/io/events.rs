//! Per-run append-only event log (`events.jsonl`).
//!
//! Each event is one JSON line written with a single `write_all` on a file
//! opened in append mode. If a previous writer died mid-line, the next writer
//! terminates the torn line first so its own record stays parseable. Readers
//! skip lines they cannot parse.
//!
//! The log is an audit trail, not a source of truth: failing to append never
//! fails the command that emitted the event.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::core::types::Delivery;

pub const EVENT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    pub schema_version: u32,
    pub timestamp: DateTime<Utc>,
    pub repo_id: String,
    pub run_id: String,
    pub event: String,
    #[serde(default)]
    pub data: Map<String, Value>,
}

/// Append one record as a single line.
pub fn append_event(path: &Path, record: &EventRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(record).context("serialize event")?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .read(true)
        .open(path)
        .with_context(|| format!("open event log {}", path.display()))?;
    if ends_mid_line(&mut file)? {
        line.insert(0, '\n');
    }
    file.write_all(line.as_bytes())
        .with_context(|| format!("append event {}", path.display()))?;
    Ok(())
}

fn ends_mid_line(file: &mut fs::File) -> Result<bool> {
    let len = file.metadata().context("stat event log")?.len();
    if len == 0 {
        return Ok(false);
    }
    file.seek(SeekFrom::Start(len - 1)).context("seek event log")?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last).context("read event log tail")?;
    Ok(last[0] != b'\n')
}

/// Parsed log plus how many lines were skipped as unreadable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventLogContents {
    pub events: Vec<EventRecord>,
    pub skipped_lines: usize,
}

pub fn read_events(path: &Path) -> Result<EventLogContents> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(EventLogContents::default()),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut log = EventLogContents::default();
    for line in contents.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<EventRecord>(line) {
            Ok(record) => log.events.push(record),
            Err(_) => log.skipped_lines += 1,
        }
    }
    Ok(log)
}

/// Best-effort emitter bound to one run.
#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
    repo_id: String,
    run_id: String,
}

impl EventLog {
    pub fn new(path: impl Into<PathBuf>, repo_id: &str, run_id: &str) -> Self {
        Self {
            path: path.into(),
            repo_id: repo_id.to_string(),
            run_id: run_id.to_string(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an event, logging (not returning) any failure.
    ///
    /// `data` should be a JSON object; other values are stored under `value`.
    pub fn emit(&self, now: DateTime<Utc>, event: &str, data: Value) -> Delivery {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        let record = EventRecord {
            schema_version: EVENT_SCHEMA_VERSION,
            timestamp: now,
            repo_id: self.repo_id.clone(),
            run_id: self.run_id.clone(),
            event: event.to_string(),
            data,
        };
        match append_event(&self.path, &record) {
            Ok(()) => Delivery::Written,
            Err(err) => {
                warn!(event, err = %format!("{err:#}"), "event append failed");
                Delivery::Dropped {
                    reason: format!("{err:#}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().expect("time")
    }

    #[test]
    fn appends_one_line_per_event() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log = EventLog::new(temp.path().join("events.jsonl"), "repo", "run");
        assert!(log.emit(now(), "push_started", json!({})).is_written());
        assert!(log.emit(now(), "push_finished", json!({"pr_number": 3})).is_written());

        let contents = read_events(log.path()).expect("read");
        assert_eq!(contents.skipped_lines, 0);
        let names: Vec<&str> = contents.events.iter().map(|e| e.event.as_str()).collect();
        assert_eq!(names, vec!["push_started", "push_finished"]);
        assert_eq!(contents.events[1].data["pr_number"], 3);
    }

    /// A torn trailing line from a crashed writer is terminated, then skipped by readers.
    #[test]
    fn torn_tail_is_isolated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");
        fs::write(&path, "{\"schema_version\":1,\"times").expect("write torn");
        let log = EventLog::new(&path, "repo", "run");
        assert!(log.emit(now(), "merge_started", json!({})).is_written());

        let contents = read_events(&path).expect("read");
        assert_eq!(contents.skipped_lines, 1);
        assert_eq!(contents.events.len(), 1);
        assert_eq!(contents.events[0].event, "merge_started");
    }

    #[test]
    fn unwritable_log_reports_dropped() {
        let temp = tempfile::tempdir().expect("tempdir");
        let blocker = temp.path().join("file");
        fs::write(&blocker, "").expect("write");
        let log = EventLog::new(blocker.join("events.jsonl"), "repo", "run");
        assert!(matches!(
            log.emit(now(), "clean_started", Value::Null),
            Delivery::Dropped { .. }
        ));
    }

    #[test]
    fn missing_log_reads_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let contents = read_events(&temp.path().join("none.jsonl")).expect("read");
        assert!(contents.events.is_empty());
    }
}
