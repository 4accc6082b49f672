//! Task Log System - ordered records of agent output
//!
//! Provides:
//! - `LogRecord` with a per-task monotonic offset starting at 1
//! - Best-effort classification of output lines (JSON or text)
//! - `HighWaterMark` so a record is forwarded at most once

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which stream a record came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    /// Standard output
    Stdout,
    /// Standard error
    Stderr,
    /// Runner messages (prompt delivery, signals)
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "stdout",
            LogStream::Stderr => "stderr",
            LogStream::System => "system",
        }
    }
}

/// One line of output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "format", content = "value", rename_all = "snake_case")]
pub enum LogLine {
    /// Structured agent message
    Json(serde_json::Value),
    Text(String),
}

impl LogLine {
    /// Any line that parses as JSON, scalars included, is structured
    pub fn classify(raw: &str) -> Self {
        match serde_json::from_str::<serde_json::Value>(raw.trim()) {
            Ok(value) => LogLine::Json(value),
            Err(_) => LogLine::Text(raw.to_string()),
        }
    }

    pub fn is_json(&self) -> bool {
        matches!(self, LogLine::Json(_))
    }

    /// Text form, JSON re-encoded compactly
    pub fn to_text(&self) -> String {
        match self {
            LogLine::Json(v) => v.to_string(),
            LogLine::Text(s) => s.clone(),
        }
    }
}

/// A single log record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Monotonic per task, starts at 1
    pub offset: u64,

    pub timestamp: DateTime<Utc>,

    pub stream: LogStream,

    pub line: LogLine,
}

impl LogRecord {
    pub fn new(offset: u64, stream: LogStream, line: LogLine) -> Self {
        Self {
            offset,
            timestamp: Utc::now(),
            stream,
            line,
        }
    }
}

/// Hands out offsets in order
#[derive(Debug, Clone, Default)]
pub struct LogSequencer {
    last: u64,
}

impl LogSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_record(&mut self, stream: LogStream, line: LogLine) -> LogRecord {
        self.last += 1;
        LogRecord::new(self.last, stream, line)
    }
}

/// Highest offset already forwarded for one task
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HighWaterMark {
    offset: u64,
}

impl HighWaterMark {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// True if `record` is past the mark; the mark then moves to it
    pub fn admit(&mut self, record: &LogRecord) -> bool {
        if record.offset > self.offset {
            self.offset = record.offset;
            true
        } else {
            false
        }
    }

    /// Records past the mark, in offset order
    pub fn filter(&mut self, mut records: Vec<LogRecord>) -> Vec<LogRecord> {
        records.sort_by_key(|r| r.offset);
        records.into_iter().filter(|r| self.admit(r)).collect()
    }
}
