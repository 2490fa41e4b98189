//! Per-pass performance records.
//!
//! A pass is bracketed by [`PassPerformance::begin`] and
//! [`PassPerformance::end`]; the end emits one [`PassRecord`] whose text form
//! is read by external analysis tooling:
//!
//! ```text
//! <PassKind> - <sourceId>:<durationSeconds>,<count1>[,<count2>]
//! ```
//!
//! The field order and count of that line must stay as they are.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::info;

/// Log target for pass records.
pub const PERF_TARGET: &str = "dca::perf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PassKind {
    /// Reading a trace file: count1 = records processed, count2 = events buffered.
    EtlReadPass,
    /// Delivering a pass to consumers: count1 = events delivered, count2 = backlog.
    EventDeliveryPass,
    /// Trimming a cache folder: count1 = files deleted, count2 = folders removed.
    FolderTrimPass,
}

impl PassKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PassKind::EtlReadPass => "EtlReadPass",
            PassKind::EventDeliveryPass => "EventDeliveryPass",
            PassKind::FolderTrimPass => "FolderTrimPass",
        }
    }
}

impl fmt::Display for PassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PassKind {
    type Err = ParsePassRecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EtlReadPass" => Ok(PassKind::EtlReadPass),
            "EventDeliveryPass" => Ok(PassKind::EventDeliveryPass),
            "FolderTrimPass" => Ok(PassKind::FolderTrimPass),
            other => Err(ParsePassRecordError::UnknownKind(other.to_string())),
        }
    }
}

/// Counters shared between the producer and consumer sides of a pass.
#[derive(Debug, Default)]
pub struct PassCounters {
    processed: AtomicU64,
    buffered: AtomicU64,
    delivered: AtomicU64,
    backlog: AtomicU64,
    backlog_recorded: AtomicBool,
    files_deleted: AtomicU64,
    folders_removed: AtomicU64,
}

impl PassCounters {
    pub fn event_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_buffered(&self) {
        self.buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_delivered(&self) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
    }

    /// Records how many events were still waiting for delivery.
    pub fn record_backlog(&self, backlog: u64) {
        self.backlog.store(backlog, Ordering::Relaxed);
        self.backlog_recorded.store(true, Ordering::Relaxed);
    }

    pub fn file_deleted(&self) {
        self.files_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn folder_removed(&self) {
        self.folders_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn buffered(&self) -> u64 {
        self.buffered.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn backlog(&self) -> Option<u64> {
        self.backlog_recorded
            .load(Ordering::Relaxed)
            .then(|| self.backlog.load(Ordering::Relaxed))
    }

    pub fn files_deleted(&self) -> u64 {
        self.files_deleted.load(Ordering::Relaxed)
    }

    pub fn folders_removed(&self) -> u64 {
        self.folders_removed.load(Ordering::Relaxed)
    }
}

/// Timer and counters for one pass.
#[derive(Debug)]
pub struct PassPerformance {
    kind: PassKind,
    source_id: String,
    started: Instant,
    counters: Arc<PassCounters>,
}

impl PassPerformance {
    pub fn begin(kind: PassKind, source_id: impl Into<String>) -> Self {
        Self {
            kind,
            source_id: source_id.into(),
            started: Instant::now(),
            counters: Arc::new(PassCounters::default()),
        }
    }

    pub fn kind(&self) -> PassKind {
        self.kind
    }

    /// Shared counters, for the side of the pass running on another task.
    pub fn counters(&self) -> &Arc<PassCounters> {
        &self.counters
    }

    pub fn event_processed(&self) {
        self.counters.event_processed();
    }

    pub fn event_buffered(&self) {
        self.counters.event_buffered();
    }

    pub fn event_delivered(&self) {
        self.counters.event_delivered();
    }

    pub fn record_backlog(&self, backlog: u64) {
        self.counters.record_backlog(backlog);
    }

    pub fn file_deleted(&self) {
        self.counters.file_deleted();
    }

    pub fn folder_removed(&self) {
        self.counters.folder_removed();
    }

    /// Ends the pass with the counts its kind reports, and logs the record.
    pub fn end(self) -> PassRecord {
        let (count1, count2) = match self.kind {
            PassKind::EtlReadPass => (self.counters.processed(), Some(self.counters.buffered())),
            PassKind::EventDeliveryPass => (self.counters.delivered(), self.counters.backlog()),
            PassKind::FolderTrimPass => (self.counters.files_deleted(), Some(self.counters.folders_removed())),
        };
        self.end_with_counts(count1, count2)
    }

    /// Ends the pass with explicit counts, and logs the record.
    pub fn end_with_counts(self, count1: u64, count2: Option<u64>) -> PassRecord {
        let record = PassRecord {
            kind: self.kind,
            source_id: self.source_id,
            duration: self.started.elapsed(),
            count1,
            count2,
        };
        info!(target: PERF_TARGET, record = %record, "pass complete");
        record
    }
}

/// One completed pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PassRecord {
    pub kind: PassKind,
    pub source_id: String,
    pub duration: Duration,
    pub count1: u64,
    pub count2: Option<u64>,
}

impl PassRecord {
    /// The record in its fixed textual shape.
    pub fn line(&self) -> String {
        self.to_string()
    }

    /// Parses a line produced by [`PassRecord::line`].
    ///
    /// Durations are kept to the millisecond, as printed.
    pub fn parse(line: &str) -> Result<Self, ParsePassRecordError> {
        line.parse()
    }
}

impl fmt::Display for PassRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - {}:{:.3},{}",
            self.kind,
            self.source_id,
            self.duration.as_secs_f64(),
            self.count1
        )?;
        if let Some(count2) = self.count2 {
            write!(f, ",{count2}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParsePassRecordError {
    #[error("pass record {0:?} does not have the shape '<kind> - <source>:<seconds>,<count>[,<count>]'")]
    Shape(String),
    #[error("unknown pass kind {0:?}")]
    UnknownKind(String),
    #[error("invalid number {0:?} in pass record")]
    Number(String),
}

impl FromStr for PassRecord {
    type Err = ParsePassRecordError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let shape = || ParsePassRecordError::Shape(line.to_string());
        let number = |s: &str| ParsePassRecordError::Number(s.to_string());

        let (kind, rest) = line.split_once(" - ").ok_or_else(shape)?;
        // Source ids may contain ':' (drive letters), the values never do.
        let (source_id, values) = rest.rsplit_once(':').ok_or_else(shape)?;

        let mut fields = values.split(',');
        let seconds = fields.next().ok_or_else(shape)?;
        let count1 = fields.next().ok_or_else(shape)?;
        let count2 = fields.next();
        if fields.next().is_some() {
            return Err(shape());
        }

        let seconds: f64 = seconds.parse().map_err(|_| number(seconds))?;
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(number(values));
        }

        Ok(PassRecord {
            kind: kind.parse()?,
            source_id: source_id.to_string(),
            duration: Duration::from_millis((seconds * 1000.0).round() as u64),
            count1: count1.parse().map_err(|_| number(count1))?,
            count2: count2.map(|c| c.parse().map_err(|_| number(c))).transpose()?,
        })
    }
}
