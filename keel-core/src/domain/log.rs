//! Log domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single log line produced while executing a pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub source: LogSource,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(source: LogSource, content: impl Into<String>) -> Self {
        Self {
            source,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    /// Parses one line of timestamped container output.
    ///
    /// Accepted shapes:
    ///
    /// ```text
    /// 2024-05-01T10:00:00.123456789Z stdout hello
    /// 2024-05-01T10:00:00.123456789Z hello
    /// ```
    ///
    /// Anything else yields an [`LogSource::Unparsed`] entry carrying the raw
    /// line and the current time.
    pub fn parse_line(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);

        let Some((head, rest)) = line.split_once(' ') else {
            return Self::new(LogSource::Unparsed, line);
        };
        let Ok(timestamp) = DateTime::parse_from_rfc3339(head) else {
            return Self::new(LogSource::Unparsed, line);
        };
        let timestamp = timestamp.with_timezone(&Utc);

        let (source, content) = match rest.split_once(' ') {
            Some(("stdout", content)) => (LogSource::Stdout, content),
            Some(("stderr", content)) => (LogSource::Stderr, content),
            _ => match rest {
                "stdout" => (LogSource::Stdout, ""),
                "stderr" => (LogSource::Stderr, ""),
                _ => (LogSource::Stdout, rest),
            },
        };

        Self {
            source,
            content: content.to_string(),
            timestamp,
        }
    }
}

/// Where a log line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Line did not match the expected format
    Unparsed,
}
