//! Fan-out of one event stream to many independently progressing consumers.
//!
//! [`FanOut`] is the delivery sink of a pass's queue. Each consumer gets every
//! event past its own resume position; the positions are read once, when the
//! pass starts, into an owned [`ResumeCursors`] value that travels with the
//! sink. A failing consumer is logged and does not hold back the others.

use crate::event::IndexedEvent;
use crate::event_index::EventIndex;
use crate::plugin::ActiveConsumer;
use crate::perf::PassCounters;
use dca_queue::DeliverySink;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, trace};

/// Resume positions of the consumers of one pass, in consumer order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeCursors {
    cursors: Vec<EventIndex>,
}

impl ResumeCursors {
    /// Reads every consumer's position for `trace_file`.
    pub fn snapshot(consumers: &[ActiveConsumer], trace_file: &str) -> Self {
        Self {
            cursors: consumers
                .iter()
                .map(|c| c.consumer.max_index_already_processed(trace_file))
                .collect(),
        }
    }

    pub fn from_indices(cursors: Vec<EventIndex>) -> Self {
        Self { cursors }
    }

    pub fn get(&self, consumer: usize) -> Option<EventIndex> {
        self.cursors.get(consumer).copied()
    }

    /// Whether consumer `consumer` still needs the event at `index`.
    ///
    /// Events at or below the cursor were already handled.
    pub fn wants(&self, consumer: usize, index: EventIndex) -> bool {
        self.get(consumer).is_some_and(|cursor| index > cursor)
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }
}

/// Per-consumer counters of a fan-out.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    pub delivered: AtomicU64,
    pub skipped: AtomicU64,
    pub failed: AtomicU64,
}

impl ConsumerStats {
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

/// Reported to the queue when at least one consumer failed an event.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{failed} of {offered} consumers failed event {index}")]
pub struct FanOutError {
    pub index: EventIndex,
    pub failed: usize,
    pub offered: usize,
}

/// Delivery sink dispatching each event to the consumers of a pass.
pub struct FanOut {
    consumers: Vec<ActiveConsumer>,
    cursors: ResumeCursors,
    stats: Arc<[ConsumerStats]>,
    counters: Option<Arc<PassCounters>>,
}

impl FanOut {
    /// Creates the sink; `cursors` must line up with `consumers`.
    pub fn new(consumers: Vec<ActiveConsumer>, cursors: ResumeCursors) -> Self {
        debug_assert_eq!(consumers.len(), cursors.len());
        let stats = consumers.iter().map(|_| ConsumerStats::default()).collect();
        Self {
            consumers,
            cursors,
            stats,
            counters: None,
        }
    }

    /// Counts every event that reached at least one consumer in `counters`.
    pub fn with_pass_counters(mut self, counters: Arc<PassCounters>) -> Self {
        self.counters = Some(counters);
        self
    }

    pub fn consumers(&self) -> &[ActiveConsumer] {
        &self.consumers
    }

    pub fn cursors(&self) -> &ResumeCursors {
        &self.cursors
    }

    /// Counters in consumer order; stays readable after the pass.
    pub fn stats(&self) -> Arc<[ConsumerStats]> {
        Arc::clone(&self.stats)
    }

    /// Offers one event to every consumer that still needs it.
    pub async fn dispatch(&self, event: &IndexedEvent, subfolder: &str) -> Result<(), FanOutError> {
        let mut offered = 0;
        let mut failed = 0;

        for (i, active) in self.consumers.iter().enumerate() {
            if !self.cursors.wants(i, event.index) {
                self.stats[i].skipped.fetch_add(1, Ordering::Relaxed);
                trace!(consumer = active.name(), index = %event.index, "already processed; skipping");
                continue;
            }

            offered += 1;
            match active.consumer.on_event_boxed(event, subfolder).await {
                Ok(()) => {
                    self.stats[i].delivered.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    failed += 1;
                    self.stats[i].failed.fetch_add(1, Ordering::Relaxed);
                    error!(
                        consumer = active.name(),
                        trace_file = %event.trace_file,
                        index = %event.index,
                        error = %e,
                        "consumer failed to process event"
                    );
                }
            }
        }

        if offered > failed {
            if let Some(counters) = &self.counters {
                counters.event_delivered();
            }
        }

        if failed > 0 {
            return Err(FanOutError {
                index: event.index,
                failed,
                offered,
            });
        }
        Ok(())
    }
}

impl DeliverySink<IndexedEvent, String> for FanOut {
    type Error = FanOutError;

    fn deliver(&mut self, item: IndexedEvent, subfolder: &String) -> impl Future<Output = Result<(), FanOutError>> + Send {
        let this = &*self;
        async move { this.dispatch(&item, subfolder).await }
    }
}
