//! Structured logging for batch pipelines.
//!
//! One JSONL record per event, written to stderr or a log file. Batch
//! jobs keep running after a per-sample failure and leave a queryable
//! trail instead of interleaved prose.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use picblocks_db::time::utc_now;

/// Severity level for log entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Canonical structured log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub level: LogLevel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl LogEntry {
    #[must_use]
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            timestamp: utc_now(),
            level,
            event: event.into(),
            sample: None,
            family: None,
            details: None,
        }
    }

    #[must_use]
    pub fn with_sample(mut self, sample: impl Into<String>) -> Self {
        self.sample = Some(sample.into());
        self
    }

    #[must_use]
    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    #[must_use]
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

enum Sink {
    Stderr,
    File(BufWriter<File>),
}

/// Writes JSONL log lines to stderr or a file.
pub struct LogEmitter {
    sink: Sink,
}

impl LogEmitter {
    #[must_use]
    pub fn stderr() -> Self {
        Self { sink: Sink::Stderr }
    }

    /// Append to a log file, creating it if needed.
    pub fn file(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            sink: Sink::File(BufWriter::new(file)),
        })
    }

    /// Write one entry as a single JSONL line.
    pub fn emit(&mut self, entry: &LogEntry) -> io::Result<()> {
        let line = serde_json::to_string(entry).map_err(io::Error::other)?;
        match &mut self.sink {
            Sink::Stderr => {
                let stderr = io::stderr();
                let mut handle = stderr.lock();
                writeln!(handle, "{line}")
            }
            Sink::File(writer) => {
                writeln!(writer, "{line}")?;
                writer.flush()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_serialize_without_empty_fields() {
        let entry = LogEntry::new(LogLevel::Info, "db_saved");
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains(r#""level":"info""#));
        assert!(json.contains(r#""event":"db_saved""#));
        assert!(!json.contains("sample"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn builder_fields_round_trip() {
        let entry = LogEntry::new(LogLevel::Warn, "sample_failed")
            .with_sample("bad.blocks")
            .with_family("acme")
            .with_details("disassembly failed: truncated");
        let json = serde_json::to_string(&entry).unwrap();
        let parsed: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.sample.as_deref(), Some("bad.blocks"));
        assert_eq!(parsed.family.as_deref(), Some("acme"));
        assert_eq!(parsed.level, LogLevel::Warn);
    }

    #[test]
    fn file_emitter_writes_parseable_lines() {
        let path = std::env::temp_dir().join(format!(
            "picblocks-log-test-{}.jsonl",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        let mut emitter = LogEmitter::file(&path).unwrap();
        emitter
            .emit(&LogEntry::new(LogLevel::Info, "one"))
            .unwrap();
        emitter
            .emit(&LogEntry::new(LogLevel::Error, "two").with_sample("x"))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let parsed: LogEntry = serde_json::from_str(line).unwrap();
            assert!(!parsed.event.is_empty());
        }
        std::fs::remove_file(&path).unwrap();
    }
}
