//! Buffered delivery: a bounded queue plus the consumer task draining it.

use crate::config::DeliveryConfig;
use crate::error::{QueueError, Rejected};
#[cfg(debug_assertions)]
use crate::invariants::debug_assert_drained;
use crate::metrics::QueueMetrics;
use crate::queue::{bounded, QueueReader, QueueWriter};
use crate::shutdown::AbortHandle;
use crate::sink::DeliverySink;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, Instrument};

/// Outcome of a drained queue.
pub struct DrainReport<S> {
    /// Items whose callback succeeded.
    pub delivered: u64,
    /// Items whose callback failed.
    pub failed: u64,
    /// The sink, handed back once the consumer task has finished with it.
    pub sink: S,
}

impl<S> std::fmt::Debug for DrainReport<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainReport")
            .field("delivered", &self.delivered)
            .field("failed", &self.failed)
            .finish_non_exhaustive()
    }
}

/// A bounded queue with its own consumer task.
///
/// One decode pass owns one `BufferedDelivery`. Items added here are handed to
/// the sink by a dedicated tokio task in FIFO order. The pass ends with
/// `complete_adding` followed by `wait_for_drain_completion`.
pub struct BufferedDelivery<T, S> {
    writer: QueueWriter<T>,
    consumer: Option<JoinHandle<S>>,
    metrics: Arc<QueueMetrics>,
}

impl<T, S> BufferedDelivery<T, S>
where
    T: Send + 'static,
    S: Send + 'static,
{
    /// Creates a queue with the given configuration and starts its consumer task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<C>(config: DeliveryConfig, context: C, sink: S) -> Self
    where
        C: Send + Sync + 'static,
        S: DeliverySink<T, C>,
    {
        let (writer, reader) = bounded(config.capacity);
        Self::spawn(writer, reader, context, sink)
    }

    /// Starts a consumer task over an existing queue.
    ///
    /// Use this when the sink needs the queue's [`AbortHandle`] before the
    /// consumer starts.
    pub fn spawn<C>(writer: QueueWriter<T>, reader: QueueReader<T>, context: C, sink: S) -> Self
    where
        C: Send + Sync + 'static,
        S: DeliverySink<T, C>,
    {
        let metrics = Arc::clone(writer.metrics());
        // The consumer task logs under the span of whoever started the pass.
        let consumer = tokio::spawn(consume(reader, context, sink).instrument(tracing::Span::current()));

        Self {
            writer,
            consumer: Some(consumer),
            metrics,
        }
    }

    /// Enqueues an item, waiting while the queue is full.
    pub async fn add(&self, item: T) -> Result<(), Rejected<T>> {
        self.writer.add(item).await
    }

    /// Enqueues an item if a slot is free right now.
    pub fn try_add(&self, item: T) -> Result<(), Rejected<T>> {
        self.writer.try_add(item)
    }

    /// Signals that no more items will be added for this pass.
    pub fn complete_adding(&mut self) {
        self.writer.complete_adding();
    }

    /// Aborts delivery for the current period.
    ///
    /// Later adds are rejected; items already queued still reach the sink.
    pub fn abort(&self) {
        self.writer.abort();
    }

    /// Returns `true` if delivery has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.writer.is_aborted()
    }

    /// Returns a cloneable handle that can abort this queue.
    pub fn abort_handle(&self) -> AbortHandle {
        self.writer.abort_handle()
    }

    /// Returns the queue counters.
    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    /// Waits until the consumer task has handed every queued item to the sink
    /// and observed completion.
    ///
    /// Completes adding first if the caller has not done so. There is no upper
    /// bound on how long this takes; wrap it in `tokio::time::timeout` if one
    /// is needed.
    pub async fn wait_for_drain_completion(mut self) -> Result<DrainReport<S>, QueueError> {
        self.writer.complete_adding();

        let consumer = self.consumer.take().ok_or(QueueError::ConsumerGone)?;
        match consumer.await {
            Ok(sink) => Ok(DrainReport {
                delivered: self.metrics.delivered(),
                failed: self.metrics.failed(),
                sink,
            }),
            Err(e) if e.is_panic() => {
                error!(
                    delivered = self.metrics.delivered(),
                    backlog = self.metrics.backlog(),
                    "delivery consumer task panicked"
                );
                Err(QueueError::ConsumerPanicked)
            }
            Err(_) => Err(QueueError::ConsumerGone),
        }
    }
}

/// Consumer loop: receive, deliver, repeat until the queue is complete and empty.
async fn consume<T, C, S>(mut reader: QueueReader<T>, context: C, mut sink: S) -> S
where
    T: Send,
    C: Sync,
    S: DeliverySink<T, C>,
{
    let metrics = Arc::clone(reader.metrics());

    while let Some(item) = reader.recv().await {
        match sink.deliver(item, &context).await {
            Ok(()) => metrics.record_delivered(),
            Err(e) => {
                metrics.record_failed();
                error!(error = %e, "delivery callback failed; continuing with next item");
            }
        }
    }

    #[cfg(debug_assertions)]
    debug_assert_drained!(metrics.enqueued(), metrics.delivered(), metrics.failed());

    debug!(
        delivered = metrics.delivered(),
        failed = metrics.failed(),
        "delivery queue drained"
    );
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::FnSink;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_delivers_in_order_with_context() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let recorder = Arc::clone(&seen);
        let sink = FnSink::new(move |n: u32, ctx: &String| {
            recorder.lock().unwrap().push((n, ctx.clone()));
            Ok::<_, std::io::Error>(())
        });
        let mut delivery = BufferedDelivery::start(DeliveryConfig::with_capacity(4), "App0".to_string(), sink);

        for i in 0..10 {
            delivery.add(i).await.unwrap();
        }
        delivery.complete_adding();

        let report = delivery.wait_for_drain_completion().await.unwrap();
        assert_eq!(report.delivered, 10);
        assert_eq!(report.failed, 0);

        let seen = seen.lock().unwrap();
        let expected: Vec<(u32, String)> = (0..10).map(|n| (n, "App0".to_string())).collect();
        assert_eq!(*seen, expected);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_callback_failure_does_not_stop_loop() {
        let sink = FnSink::new(|n: u32, _ctx: &()| {
            if n % 3 == 0 {
                return Err(format!("cannot deliver {n}"));
            }
            Ok(())
        });
        let delivery = BufferedDelivery::start(DeliveryConfig::default(), (), sink);

        for i in 1..=9 {
            delivery.add(i).await.unwrap();
        }

        let report = delivery.wait_for_drain_completion().await.unwrap();
        assert_eq!(report.delivered, 6);
        assert_eq!(report.failed, 3);
        assert!(logs_contain("delivery callback failed"));
        assert!(logs_contain("cannot deliver 6"));
    }

    #[tokio::test]
    async fn test_panicking_sink_is_reported() {
        let sink = FnSink::new(|_n: u32, _ctx: &()| -> Result<(), String> { panic!("sink exploded") });
        let delivery = BufferedDelivery::start(DeliveryConfig::default(), (), sink);
        delivery.add(1).await.unwrap();

        let err = delivery.wait_for_drain_completion().await.unwrap_err();
        assert_eq!(err, QueueError::ConsumerPanicked);
    }
}
