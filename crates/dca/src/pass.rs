//! One decode pass over one trace file.
//!
//! A pass opens the processing period on every active consumer, snapshots
//! their resume positions, validates and indexes the decoded records, and
//! feeds them through a buffered delivery queue whose sink is the fan-out.
//! It then completes adding, waits for the drain, closes the period on every
//! consumer and emits the pass records.
//!
//! An optional [`EventFilter`] drops events before they are indexed, and an
//! optional time budget stops reading once it is spent; the events read so
//! far are still delivered and the next pass resumes after them.
//!
//! Passes over different trace files share no mutable state and can run
//! concurrently, one task each.

use crate::event::{DecodedEvent, DecodedRecord, IndexedEvent};
use crate::event_index::EventIndexer;
use crate::fanout::{ConsumerStats, FanOut, ResumeCursors};
use crate::filter::EventFilter;
use crate::paths;
use crate::perf::{PassKind, PassPerformance, PassRecord};
use crate::plugin::ActiveConsumer;
use dca_queue::{AbortHandle, BufferedDelivery, DeliveryConfig, QueueError, QueueReader, QueueWriter};
use std::future::Future;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("cannot read trace file: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt trace record: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PassError {
    #[error("delivery queue failed: {0}")]
    Queue(#[from] QueueError),
}

/// Produces the decoded records of one trace file, in file order.
pub trait DecodeSource: Send {
    /// Next record, or `None` at the end of the file.
    fn next_record(&mut self) -> impl Future<Output = Option<Result<DecodedRecord, DecodeError>>> + Send;
}

/// A decode source over records already in memory.
#[derive(Debug, Clone)]
pub struct IterSource<I> {
    records: I,
}

impl<I> IterSource<I>
where
    I: Iterator<Item = Result<DecodedRecord, DecodeError>> + Send,
{
    pub fn new(records: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            records: records.into_iter(),
        }
    }
}

/// Wraps infallible records.
pub fn records<R>(records: R) -> IterSource<impl Iterator<Item = Result<DecodedRecord, DecodeError>> + Send>
where
    R: IntoIterator<Item = DecodedRecord>,
    R::IntoIter: Send,
{
    IterSource::new(records.into_iter().map(Ok))
}

impl<I> DecodeSource for IterSource<I>
where
    I: Iterator<Item = Result<DecodedRecord, DecodeError>> + Send,
{
    async fn next_record(&mut self) -> Option<Result<DecodedRecord, DecodeError>> {
        self.records.next()
    }
}

/// Outcome of a pass.
#[derive(Debug)]
pub struct PassReport {
    pub trace_file: Arc<str>,
    /// Records rejected by validation.
    pub malformed: u64,
    /// Valid events the filter dropped.
    pub filtered: u64,
    /// Events handed to the queue.
    pub enqueued: u64,
    /// Events every offered consumer accepted.
    pub delivered: u64,
    /// Events at least one consumer failed.
    pub failed: u64,
    /// The pass stopped reading early (abort or decode failure).
    pub aborted: bool,
    /// The pass stopped reading because its time budget ran out.
    pub budget_exhausted: bool,
    /// Per-consumer counters, in the order of the pass's consumers.
    pub consumer_stats: Arc<[ConsumerStats]>,
    pub read_record: PassRecord,
    pub delivery_record: PassRecord,
}

/// A decode pass, ready to run.
pub struct DecodePass {
    trace_file: Arc<str>,
    subfolder: String,
    is_active_file: bool,
    filter: Option<EventFilter>,
    time_budget: Option<Duration>,
    consumers: Vec<ActiveConsumer>,
    writer: QueueWriter<IndexedEvent>,
    reader: QueueReader<IndexedEvent>,
}

impl DecodePass {
    /// Prepares a pass over `trace_file` for `consumers`.
    ///
    /// The subfolder tag defaults to the application id in the trace file's
    /// path, if any.
    pub fn new(trace_file: impl Into<Arc<str>>, consumers: Vec<ActiveConsumer>, config: DeliveryConfig) -> Self {
        let trace_file = trace_file.into();
        let subfolder = paths::subfolder_for(Path::new(&*trace_file));
        let (writer, reader) = dca_queue::bounded(config.capacity);
        Self {
            trace_file,
            subfolder,
            is_active_file: false,
            filter: None,
            time_budget: None,
            consumers,
            writer,
            reader,
        }
    }

    pub fn with_subfolder(mut self, subfolder: impl Into<String>) -> Self {
        self.subfolder = subfolder.into();
        self
    }

    /// Marks the file as the one the trace session is still writing.
    pub fn with_active_file(mut self, is_active_file: bool) -> Self {
        self.is_active_file = is_active_file;
        self
    }

    /// Delivers only the events `filter` allows.
    pub fn with_filter(mut self, filter: EventFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Stops reading once `budget` has elapsed since the pass started.
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = Some(budget);
        self
    }

    /// Handle that stops the pass from reading further.
    ///
    /// Events already queued are still delivered.
    pub fn abort_handle(&self) -> AbortHandle {
        self.writer.abort_handle()
    }

    pub fn trace_file(&self) -> &str {
        &self.trace_file
    }

    pub fn subfolder(&self) -> &str {
        &self.subfolder
    }

    /// Runs the pass to completion.
    pub async fn run<S: DecodeSource>(self, mut source: S) -> Result<PassReport, PassError> {
        let DecodePass {
            trace_file,
            subfolder,
            is_active_file,
            filter,
            time_budget,
            consumers,
            writer,
            reader,
        } = self;
        let deadline = time_budget.map(|budget| Instant::now() + budget);

        for active in &consumers {
            if let Err(e) = active
                .consumer
                .on_processing_period_start_boxed(&trace_file, is_active_file, &subfolder)
                .await
            {
                error!(consumer = active.name(), %trace_file, error = %e, "cannot start processing period");
            }
        }

        let cursors = ResumeCursors::snapshot(&consumers, &trace_file);
        debug!(%trace_file, %subfolder, ?cursors, "starting decode pass");

        let read_perf = PassPerformance::begin(PassKind::EtlReadPass, &*trace_file);
        let delivery_perf = PassPerformance::begin(PassKind::EventDeliveryPass, &*trace_file);
        let fanout = FanOut::new(consumers.clone(), cursors).with_pass_counters(Arc::clone(delivery_perf.counters()));
        let consumer_stats = fanout.stats();

        let mut delivery = BufferedDelivery::spawn(writer, reader, subfolder.clone(), fanout);
        let mut indexer = EventIndexer::new();
        let mut malformed = 0u64;
        let mut filtered = 0u64;
        let mut aborted = false;
        let mut budget_exhausted = false;

        loop {
            if delivery.is_aborted() {
                aborted = true;
                break;
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                budget_exhausted = true;
                info!(%trace_file, read = read_perf.counters().processed(), "time budget spent; stopping decode pass");
                break;
            }
            let record = match source.next_record().await {
                None => break,
                Some(Ok(record)) => record,
                Some(Err(e)) => {
                    error!(%trace_file, error = %e, "decoding failed; aborting delivery for this period");
                    delivery.abort();
                    aborted = true;
                    break;
                }
            };
            read_perf.event_processed();

            let event = match DecodedEvent::try_from_record(record) {
                Ok(event) => event,
                Err(e) => {
                    malformed += 1;
                    warn!(%trace_file, error = %e, "dropping malformed event");
                    continue;
                }
            };

            if filter.as_ref().is_some_and(|filter| !filter.allows(&event)) {
                filtered += 1;
                trace!(%trace_file, task = event.task_name(), level = %event.level(), "filtered out");
                continue;
            }

            let index = indexer.next_index(event.timestamp());
            match delivery.add(IndexedEvent::new(Arc::clone(&trace_file), index, event)).await {
                Ok(()) => read_perf.event_buffered(),
                Err(rejected) => {
                    aborted = true;
                    if rejected.reason == QueueError::Aborted {
                        info!(%trace_file, %index, "delivery aborted; stopping decode pass");
                    } else {
                        error!(%trace_file, %index, error = %rejected.reason, "delivery queue refused event");
                    }
                    break;
                }
            }
        }

        delivery.complete_adding();
        delivery_perf.record_backlog(delivery.metrics().backlog());
        let read_record = read_perf.end();
        let enqueued = delivery.metrics().enqueued();

        let drained = delivery.wait_for_drain_completion().await;

        for active in &consumers {
            if let Err(e) = active
                .consumer
                .on_processing_period_stop_boxed(&trace_file, is_active_file, &subfolder)
                .await
            {
                error!(consumer = active.name(), %trace_file, error = %e, "cannot stop processing period");
            }
        }

        let drained = drained?;
        let delivery_record = delivery_perf.end();

        Ok(PassReport {
            trace_file,
            malformed,
            filtered,
            enqueued,
            delivered: drained.delivered,
            failed: drained.failed,
            aborted,
            budget_exhausted,
            consumer_stats,
            read_record,
            delivery_record,
        })
    }
}
