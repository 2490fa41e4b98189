//! Decoded event envelope.

use crate::event_index::EventIndex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Severity of a trace event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Level {
    Critical = 1,
    Error = 2,
    Warning = 3,
    Informational = 4,
    Verbose = 5,
}

impl Level {
    pub fn from_u8(level: u8) -> Option<Self> {
        match level {
            1 => Some(Level::Critical),
            2 => Some(Level::Error),
            3 => Some(Level::Warning),
            4 => Some(Level::Informational),
            5 => Some(Level::Verbose),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Level::Critical => "Critical",
            Level::Error => "Error",
            Level::Warning => "Warning",
            Level::Informational => "Informational",
            Level::Verbose => "Verbose",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record as handed over by the decode source, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub timestamp: i64,
    pub task_name: Option<String>,
    pub event_type: Option<String>,
    pub level: u8,
    pub thread_id: u32,
    pub process_id: u32,
    pub text: String,
}

/// Why a record was filtered out before delivery.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MalformedEvent {
    #[error("record at timestamp {timestamp} has no task name")]
    MissingTaskName { timestamp: i64 },
    #[error("record at timestamp {timestamp} has no event type")]
    MissingEventType { timestamp: i64 },
    #[error("record at timestamp {timestamp} has unknown level {level}")]
    InvalidLevel { timestamp: i64, level: u8 },
}

/// Validated, immutable trace event shared by every consumer of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedEvent {
    task_name: String,
    event_type: String,
    level: Level,
    timestamp: i64,
    thread_id: u32,
    process_id: u32,
    text: String,
    flattened: String,
}

impl DecodedEvent {
    /// Validates a raw record.
    ///
    /// Records without a task name or event type, or with a level outside
    /// 1..=5, are rejected.
    pub fn try_from_record(record: DecodedRecord) -> Result<Self, MalformedEvent> {
        let timestamp = record.timestamp;
        let task_name = non_empty(record.task_name).ok_or(MalformedEvent::MissingTaskName { timestamp })?;
        let event_type = non_empty(record.event_type).ok_or(MalformedEvent::MissingEventType { timestamp })?;
        let level = Level::from_u8(record.level).ok_or(MalformedEvent::InvalidLevel {
            timestamp,
            level: record.level,
        })?;

        let flattened = format!(
            "{},{},{},{},{}.{},{}",
            timestamp,
            level,
            record.thread_id,
            record.process_id,
            task_name,
            event_type,
            flatten_text(&record.text)
        );

        Ok(Self {
            task_name,
            event_type,
            level,
            timestamp,
            thread_id: record.thread_id,
            process_id: record.process_id,
            text: record.text,
            flattened,
        })
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn level(&self) -> Level {
        self.level
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn thread_id(&self) -> u32 {
        self.thread_id
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// Single-line form: `timestamp,level,thread,process,task.eventType,text`.
    pub fn flattened(&self) -> &str {
        &self.flattened
    }
}

fn non_empty(field: Option<String>) -> Option<String> {
    field.filter(|s| !s.is_empty())
}

/// Line breaks inside event text become tabs so one event is one line.
fn flatten_text(text: &str) -> String {
    text.replace("\r\n", "\t").replace(['\n', '\r'], "\t")
}

/// A decoded event together with the trace file it came from and its
/// position in that file.
///
/// Cloning is cheap; the file id and the event are shared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedEvent {
    pub trace_file: Arc<str>,
    pub index: EventIndex,
    pub event: Arc<DecodedEvent>,
}

impl IndexedEvent {
    pub fn new(trace_file: Arc<str>, index: EventIndex, event: DecodedEvent) -> Self {
        Self {
            trace_file,
            index,
            event: Arc::new(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(text: &str) -> DecodedRecord {
        DecodedRecord {
            timestamp: 131_000,
            task_name: Some("Transport".into()),
            event_type: Some("Send".into()),
            level: 4,
            thread_id: 12,
            process_id: 3400,
            text: text.into(),
        }
    }

    #[test]
    fn test_flattened_form() {
        let event = DecodedEvent::try_from_record(record("hello")).unwrap();
        assert_eq!(event.flattened(), "131000,Informational,12,3400,Transport.Send,hello");
        assert_eq!(event.level(), Level::Informational);
        assert_eq!(event.task_name(), "Transport");
    }

    #[test]
    fn test_line_breaks_become_tabs() {
        let event = DecodedEvent::try_from_record(record("a\r\nb\nc\rd")).unwrap();
        assert!(event.flattened().ends_with(",a\tb\tc\td"));
        // The raw text is kept as decoded.
        assert_eq!(event.text(), "a\r\nb\nc\rd");
    }

    #[test]
    fn test_missing_fields_are_malformed() {
        let mut r = record("x");
        r.task_name = None;
        assert_eq!(
            DecodedEvent::try_from_record(r),
            Err(MalformedEvent::MissingTaskName { timestamp: 131_000 })
        );

        let mut r = record("x");
        r.event_type = Some(String::new());
        assert_eq!(
            DecodedEvent::try_from_record(r),
            Err(MalformedEvent::MissingEventType { timestamp: 131_000 })
        );

        let mut r = record("x");
        r.level = 9;
        assert!(matches!(
            DecodedEvent::try_from_record(r),
            Err(MalformedEvent::InvalidLevel { level: 9, .. })
        ));
    }

    #[test]
    fn test_level_round_trip() {
        for n in 1..=5u8 {
            let level = Level::from_u8(n).unwrap();
            assert_eq!(level as u8, n);
        }
        assert_eq!(Level::from_u8(0), None);
    }
}
