//! Reference consumers.
//!
//! - [`CsvFileConsumer`]: writes flattened events into per-file CSV files under
//!   a local directory and checkpoints its resume state at the end of each pass
//! - [`MemoryConsumer`]: keeps everything it receives in memory

use crate::consumer::{ConsumerError, TraceConsumer};
use crate::event::IndexedEvent;
use crate::event_index::EventIndex;
use crate::resume::{ResumeState, ResumeStateError};
use crate::retry::{io_retry_decision, perform_io_with_retries_async, perform_with_retries_async, RetryConfig, RetryDecision};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// File name of the persisted resume state inside the consumer's directory.
pub const RESUME_STATE_FILE: &str = "resume.json";

#[derive(Debug, Default)]
struct PendingFile {
    lines: Vec<String>,
    last: Option<EventIndex>,
}

/// Writes events as CSV lines into `<root>/<subfolder>/<trace file>.csv`.
///
/// Lines are buffered during a pass and appended when the pass stops; only
/// then does the consumer's resume position move. Writes are retried per the
/// consumer's [`RetryConfig`]. A pass that still fails to flush keeps its
/// lines buffered and leaves the position where it was; events the next pass
/// delivers again are not buffered twice.
pub struct CsvFileConsumer {
    name: String,
    root: PathBuf,
    retry: RetryConfig,
    resume: Mutex<ResumeState>,
    pending: Mutex<HashMap<String, PendingFile>>,
    save_lock: tokio::sync::Mutex<()>,
}

impl CsvFileConsumer {
    /// Opens the consumer directory, loading any resume state saved there.
    pub async fn open(name: impl Into<String>, root: impl Into<PathBuf>) -> Result<Self, ResumeStateError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        let resume = ResumeState::load(&root.join(RESUME_STATE_FILE)).await?;
        Ok(Self {
            name: name.into(),
            root,
            retry: RetryConfig::default(),
            resume: Mutex::new(resume),
            pending: Mutex::new(HashMap::new()),
            save_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Budget for the appends and resume state saves.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the CSV file for a trace file and subfolder.
    pub fn output_path(&self, trace_file: &str, subfolder: &str) -> PathBuf {
        let stem = Path::new(trace_file)
            .file_stem()
            .map_or_else(|| trace_file.to_string(), |s| s.to_string_lossy().into_owned());
        self.root.join(subfolder).join(format!("{stem}.csv"))
    }

    /// Snapshot of the committed resume positions.
    pub fn resume_state(&self) -> ResumeState {
        self.resume.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Forgets a trace file that has been removed for good.
    pub async fn retire(&self, trace_file: &str) -> Result<(), ConsumerError> {
        self.resume
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retire(trace_file);
        self.save().await
    }

    async fn save(&self) -> Result<(), ConsumerError> {
        let _guard = self.save_lock.lock().await;
        let snapshot = self.resume_state();
        let path = self.root.join(RESUME_STATE_FILE);
        let policy = |e: &ResumeStateError| match e {
            ResumeStateError::Io(e) => io_retry_decision(e),
            _ => RetryDecision::Abort,
        };
        perform_with_retries_async(path.as_path(), |p| snapshot.save(p), &policy, &self.retry)
            .await
            .map_err(|e| match e {
                ResumeStateError::Io(e) => ConsumerError::Io(e),
                other => ConsumerError::Failed(other.to_string()),
            })
    }

    /// Puts the lines of a failed flush back ahead of anything buffered since.
    fn restore_pending(&self, trace_file: &str, lines: Vec<String>, last: EventIndex) {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let file = pending.entry(trace_file.to_string()).or_default();
        let newer = std::mem::replace(&mut file.lines, lines);
        file.lines.extend(newer);
        file.last = file.last.max(Some(last));
    }
}

async fn append_lines(path: &Path, body: &str) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut out = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    out.write_all(body.as_bytes()).await?;
    out.flush().await
}

impl TraceConsumer for CsvFileConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_event(&self, event: &IndexedEvent, _subfolder: &str) -> Result<(), ConsumerError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let file = pending.entry(event.trace_file.to_string()).or_default();
        // Already buffered by a pass whose flush failed.
        if file.last.is_some_and(|last| event.index <= last) {
            return Ok(());
        }
        file.lines.push(event.event.flattened().to_string());
        file.last = Some(event.index);
        Ok(())
    }

    async fn on_processing_period_stop(&self, trace_file: &str, is_active_file: bool, subfolder: &str) -> Result<(), ConsumerError> {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(trace_file);
        let Some(PendingFile { lines, last: Some(last) }) = pending else {
            return Ok(());
        };

        let path = self.output_path(trace_file, subfolder);
        let mut body = lines.join("\n");
        body.push('\n');
        let body = body.as_str();
        if let Err(e) = perform_io_with_retries_async(path.as_path(), |p| append_lines(p, body), &self.retry).await {
            warn!(
                consumer = %self.name,
                trace_file,
                file = %path.display(),
                error = %e,
                "cannot flush pass; keeping lines for the next one"
            );
            self.restore_pending(trace_file, lines, last);
            return Err(e.into());
        }

        self.resume
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(trace_file, last);
        self.save().await?;

        debug!(
            consumer = %self.name,
            trace_file,
            is_active_file,
            lines = lines.len(),
            resume = %last,
            "flushed pass"
        );
        Ok(())
    }

    fn max_index_already_processed(&self, trace_file: &str) -> EventIndex {
        self.resume
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(trace_file)
    }
}

/// One event as seen by a [`MemoryConsumer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub trace_file: String,
    pub index: EventIndex,
    pub subfolder: String,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeriodMark {
    Start { trace_file: String, subfolder: String },
    Stop { trace_file: String, subfolder: String },
}

/// Keeps every delivery in memory and advances its resume position per event.
pub struct MemoryConsumer {
    name: String,
    resume: Mutex<ResumeState>,
    deliveries: Mutex<Vec<Delivery>>,
    periods: Mutex<Vec<PeriodMark>>,
}

impl MemoryConsumer {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_resume_state(name, ResumeState::new())
    }

    /// Starts from previously persisted positions.
    pub fn with_resume_state(name: impl Into<String>, resume: ResumeState) -> Self {
        Self {
            name: name.into(),
            resume: Mutex::new(resume),
            deliveries: Mutex::new(Vec::new()),
            periods: Mutex::new(Vec::new()),
        }
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.deliveries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn delivered_indices(&self, trace_file: &str) -> Vec<EventIndex> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|d| d.trace_file == trace_file)
            .map(|d| d.index)
            .collect()
    }

    pub fn periods(&self) -> Vec<PeriodMark> {
        self.periods.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn resume_state(&self) -> ResumeState {
        self.resume.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl TraceConsumer for MemoryConsumer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn on_processing_period_start(&self, trace_file: &str, _is_active_file: bool, subfolder: &str) -> Result<(), ConsumerError> {
        self.periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PeriodMark::Start {
                trace_file: trace_file.to_string(),
                subfolder: subfolder.to_string(),
            });
        Ok(())
    }

    async fn on_event(&self, event: &IndexedEvent, subfolder: &str) -> Result<(), ConsumerError> {
        self.deliveries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Delivery {
                trace_file: event.trace_file.to_string(),
                index: event.index,
                subfolder: subfolder.to_string(),
                line: event.event.flattened().to_string(),
            });
        self.resume
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(&event.trace_file, event.index);
        Ok(())
    }

    async fn on_processing_period_stop(&self, trace_file: &str, _is_active_file: bool, subfolder: &str) -> Result<(), ConsumerError> {
        self.periods
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PeriodMark::Stop {
                trace_file: trace_file.to_string(),
                subfolder: subfolder.to_string(),
            });
        Ok(())
    }

    fn max_index_already_processed(&self, trace_file: &str) -> EventIndex {
        self.resume
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(trace_file)
    }
}
