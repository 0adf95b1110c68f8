// Audit log of a single tool run
// The log is the only record of what was matched, skipped or redirected, so it is
// returned to the caller in full; every entry is mirrored to tracing as well.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ts = self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true);
        match self.level {
            LogLevel::Info => write!(f, "[{}] {}", ts, self.message),
            LogLevel::Warn => write!(f, "[{}] WARN {}", ts, self.message),
        }
    }
}

/// Ordered, append-only sequence of log entries
#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    entries: Vec<LogEntry>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, level: LogLevel, message: String) {
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        });
    }

    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{}", message);
        self.push(LogLevel::Info, message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.push(LogLevel::Warn, message);
    }

    /// Header line separating the phases of a run
    pub fn section(&mut self, title: &str) {
        self.info(format!("=== {} ===", title));
    }

    #[cfg(test)]
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn warnings(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| e.level == LogLevel::Warn)
    }

    /// Rendered lines, oldest first
    pub fn lines(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_keep_insertion_order() {
        let mut log = AuditLog::new();
        log.section("Library Mapping");
        log.info("Audiobooks -> Audiobooks");
        log.warn("No match for library Podcasts");

        let messages: Vec<_> = log.entries().iter().map(|e| e.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "=== Library Mapping ===",
                "Audiobooks -> Audiobooks",
                "No match for library Podcasts"
            ]
        );
        assert_eq!(log.warnings().count(), 1);
        assert!(log.entries()[0].timestamp <= log.entries()[2].timestamp);
    }

    #[test]
    fn test_rendered_lines_mark_warnings() {
        let mut log = AuditLog::new();
        log.info("plain");
        log.warn("careful");

        let lines = log.lines();
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] plain"));
        assert!(lines[1].ends_with("] WARN careful"));
    }
}
