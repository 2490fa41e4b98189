//! Time-bounded delivery rounds over the buffered trace files of a session.
//!
//! A round runs one [`DecodePass`] per trace file, newest file first, so
//! fresh events reach the consumers ahead of an old backlog. Files last
//! written before the age cutoff are skipped. Once the round's time budget is
//! spent it stops after the current file; the files it did not get to are
//! reported as the backlog for the next round.

use crate::filter::EventFilter;
use crate::pass::{DecodeError, DecodePass, DecodeSource, PassReport};
use crate::perf::PERF_TARGET;
use crate::plugin::ActiveConsumer;
use crate::retry::{perform_io_with_retries_async, RetryConfig};
use dca_queue::DeliveryConfig;
use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// A buffered trace file waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceFile {
    pub path: PathBuf,
    /// Last write time.
    pub modified: SystemTime,
    /// The trace session is still writing to it.
    pub is_active: bool,
}

impl TraceFile {
    /// Reads the last write time of `path`.
    pub async fn from_path(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        let modified = tokio::fs::metadata(&path).await?.modified()?;
        Ok(Self {
            path,
            modified,
            is_active: false,
        })
    }

    pub fn with_active(mut self, is_active: bool) -> Self {
        self.is_active = is_active;
        self
    }

    fn id(&self) -> String {
        self.path.display().to_string()
    }
}

/// Lists the files of `dir` with the given extension, e.g. `"etl"`.
pub async fn list_trace_files(dir: &Path, extension: &str) -> io::Result<Vec<TraceFile>> {
    let mut read = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = read.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() || path.extension().map_or(true, |ext| ext != extension) {
            continue;
        }
        match TraceFile::from_path(path).await {
            Ok(file) => files.push(file),
            // Removed since the listing.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
    Ok(files)
}

/// Outcome of a delivery round.
#[derive(Debug, Default)]
pub struct RoundReport {
    /// Files fully delivered, in the order they were processed.
    pub processed: Vec<PathBuf>,
    /// Files skipped for being older than the cutoff.
    pub expired: u64,
    /// Files whose source could not be opened or whose pass failed.
    pub failed: u64,
    /// Processed files removed afterwards.
    pub deleted: u64,
    /// Files in the round that were not fully delivered.
    pub backlog: u64,
    pub budget_exhausted: bool,
    /// The round was stopped through its token.
    pub stopped: bool,
    pub passes: Vec<PassReport>,
}

/// Runs decode passes over a set of trace files within a time budget.
///
/// # Example
///
/// ```ignore
/// let round = DeliveryRound::new(registry.active(flags), config.delivery_config())
///     .with_pass_length(Duration::from_secs(75))
///     .with_max_age(Duration::from_secs(3 * 24 * 3600));
/// let files = list_trace_files(&trace_folder, "etl").await?;
/// let report = round.run(files, |file| EtlSource::open(&file.path)).await;
/// ```
pub struct DeliveryRound {
    consumers: Vec<ActiveConsumer>,
    delivery: DeliveryConfig,
    pass_length: Option<Duration>,
    max_age: Option<Duration>,
    filter: Option<EventFilter>,
    delete_processed: bool,
    retry: RetryConfig,
    stop: CancellationToken,
}

impl DeliveryRound {
    pub fn new(consumers: Vec<ActiveConsumer>, delivery: DeliveryConfig) -> Self {
        Self {
            consumers,
            delivery,
            pass_length: None,
            max_age: None,
            filter: None,
            delete_processed: false,
            retry: RetryConfig::default(),
            stop: CancellationToken::new(),
        }
    }

    /// Time budget for the whole round.
    pub fn with_pass_length(mut self, pass_length: Duration) -> Self {
        self.pass_length = Some(pass_length);
        self
    }

    /// Skips files last written longer ago than `max_age`.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = Some(max_age);
        self
    }

    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Deletes fully delivered files that are no longer being written.
    pub fn with_delete_processed(mut self, delete: bool) -> Self {
        self.delete_processed = delete;
        self
    }

    /// Budget for deleting processed files.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Token that stops the round; the running pass is aborted and drains.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Runs one round over `files`, opening each through `open`.
    pub async fn run<F, Fut, S>(&self, files: Vec<TraceFile>, mut open: F) -> RoundReport
    where
        F: FnMut(&TraceFile) -> Fut,
        Fut: Future<Output = Result<S, DecodeError>>,
        S: DecodeSource,
    {
        let deadline = self.pass_length.map(|length| Instant::now() + length);
        let cutoff = self.max_age.and_then(|age| SystemTime::now().checked_sub(age));
        let mut report = RoundReport::default();

        let (mut eligible, expired): (Vec<_>, Vec<_>) = files
            .into_iter()
            .partition(|file| cutoff.map_or(true, |cutoff| file.modified > cutoff));
        report.expired = expired.len() as u64;
        for file in &expired {
            debug!(file = %file.path.display(), "older than the cutoff; not delivering");
        }
        eligible.sort_by(|a, b| b.modified.cmp(&a.modified));

        for file in &eligible {
            if self.stop.is_cancelled() {
                report.stopped = true;
                break;
            }

            let source = match open(file).await {
                Ok(source) => source,
                Err(e) => {
                    report.failed += 1;
                    error!(file = %file.path.display(), error = %e, "cannot open trace file");
                    continue;
                }
            };

            let mut pass = DecodePass::new(file.id(), self.consumers.clone(), self.delivery).with_active_file(file.is_active);
            if let Some(filter) = &self.filter {
                pass = pass.with_filter(filter.clone());
            }
            if let Some(deadline) = deadline {
                pass = pass.with_time_budget(deadline.saturating_duration_since(Instant::now()));
            }

            let abort = pass.abort_handle();
            let stop = self.stop.clone();
            let forward = tokio::spawn(async move {
                stop.cancelled().await;
                abort.abort();
            });
            let result = pass.run(source).await;
            forward.abort();

            match result {
                Ok(pass) => {
                    let complete = !pass.aborted && !pass.budget_exhausted;
                    let out_of_time = pass.budget_exhausted;
                    report.passes.push(pass);
                    if complete {
                        report.processed.push(file.path.clone());
                    } else if self.stop.is_cancelled() {
                        report.stopped = true;
                        break;
                    } else if out_of_time {
                        report.budget_exhausted = true;
                        break;
                    } else {
                        report.failed += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    error!(file = %file.path.display(), error = %e, "decode pass failed");
                }
            }

            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                report.budget_exhausted = true;
                break;
            }
        }

        report.backlog = (eligible.len() - report.processed.len()) as u64;
        if self.delete_processed {
            report.deleted = self.delete(&eligible, &report.processed).await;
        }

        info!(
            target: PERF_TARGET,
            processed = report.processed.len(),
            backlog = report.backlog,
            expired = report.expired,
            budget_exhausted = report.budget_exhausted,
            "delivery round complete"
        );
        report
    }

    async fn delete(&self, files: &[TraceFile], processed: &[PathBuf]) -> u64 {
        let mut deleted = 0;
        let done = files
            .iter()
            .filter(|file| !file.is_active && processed.contains(&file.path));
        for file in done {
            match perform_io_with_retries_async(file.path.as_path(), |p| tokio::fs::remove_file(p), &self.retry).await {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(file = %file.path.display(), error = %e, "cannot delete delivered trace file"),
            }
        }
        deleted
    }
}
