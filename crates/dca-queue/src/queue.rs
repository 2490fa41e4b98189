//! Bounded queue halves: a single writer and a single reader.

use crate::error::{QueueError, Rejected};
use crate::metrics::QueueMetrics;
use crate::shutdown::{AbortHandle, QueueState};
use futures_core::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// Creates a bounded queue with room for `capacity` items.
///
/// Returns the writer used by the decode pass and the reader used by the
/// consumer task. A capacity of zero is treated as one.
///
/// # Example
///
/// ```ignore
/// let (writer, mut reader) = dca_queue::bounded::<u64>(4);
/// writer.add(1).await.unwrap();
/// assert_eq!(reader.recv().await, Some(1));
/// ```
pub fn bounded<T: Send>(capacity: usize) -> (QueueWriter<T>, QueueReader<T>) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::channel(capacity);
    let state = Arc::new(QueueState::new());
    let metrics = Arc::new(QueueMetrics::default());

    let writer = QueueWriter {
        tx: Some(tx),
        capacity,
        state,
        metrics: Arc::clone(&metrics),
    };
    let reader = QueueReader { rx, metrics };

    (writer, reader)
}

/// Producer half of a bounded queue.
///
/// # Note
///
/// `QueueWriter` does NOT implement `Clone`. A queue has exactly one decode
/// pass feeding it, and `complete_adding` has to be able to close it.
pub struct QueueWriter<T> {
    tx: Option<mpsc::Sender<T>>,
    capacity: usize,
    state: Arc<QueueState>,
    metrics: Arc<QueueMetrics>,
}

impl<T: Send> QueueWriter<T> {
    /// Enqueues an item, waiting for a free slot if the queue is full.
    ///
    /// This is the backpressure point: a slow consumer holds the producer
    /// here. If delivery is aborted while waiting, the wait ends and the item
    /// is handed back.
    pub async fn add(&self, item: T) -> Result<(), Rejected<T>> {
        let tx = match self.open_sender() {
            Ok(tx) => tx,
            Err(reason) => return Err(self.reject(item, reason)),
        };

        let permit = tokio::select! {
            biased;

            () = self.state.aborted() => {
                return Err(self.reject(item, QueueError::Aborted));
            }
            permit = tx.reserve() => permit,
        };

        match permit {
            Ok(permit) => {
                permit.send(item);
                self.metrics.record_enqueued();
                Ok(())
            }
            Err(_) => Err(self.reject(item, QueueError::ConsumerGone)),
        }
    }

    /// Attempts to enqueue an item without waiting.
    ///
    /// Returns the item inside `Rejected` with `QueueError::Full` when there
    /// is no free slot.
    pub fn try_add(&self, item: T) -> Result<(), Rejected<T>> {
        let tx = match self.open_sender() {
            Ok(tx) => tx,
            Err(reason) => return Err(self.reject(item, reason)),
        };

        match tx.try_send(item) {
            Ok(()) => {
                self.metrics.record_enqueued();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(item)) => Err(self.reject(item, QueueError::Full)),
            Err(mpsc::error::TrySendError::Closed(item)) => {
                Err(self.reject(item, QueueError::ConsumerGone))
            }
        }
    }

    /// Enqueues an item from synchronous code, blocking the thread while the
    /// queue is full.
    ///
    /// # Panics
    ///
    /// Panics if called from inside an async execution context, like
    /// `tokio::sync::mpsc::Sender::blocking_send`.
    pub fn blocking_add(&self, item: T) -> Result<(), Rejected<T>> {
        let tx = match self.open_sender() {
            Ok(tx) => tx,
            Err(reason) => return Err(self.reject(item, reason)),
        };

        match tx.blocking_send(item) {
            Ok(()) => {
                self.metrics.record_enqueued();
                Ok(())
            }
            Err(mpsc::error::SendError(item)) => Err(self.reject(item, QueueError::ConsumerGone)),
        }
    }

    /// Signals that no more items will be added.
    ///
    /// The reader keeps yielding queued items and then reports the end of the
    /// stream. Idempotent.
    pub fn complete_adding(&mut self) {
        if self.state.complete() {
            tracing::debug!(
                enqueued = self.metrics.enqueued(),
                "delivery queue complete for adding"
            );
        }
        self.tx = None;
    }

    /// Returns `true` once `complete_adding` has been called.
    pub fn is_completed(&self) -> bool {
        self.state.is_completed()
    }

    /// Aborts delivery for the current period. See [`AbortHandle`].
    pub fn abort(&self) {
        self.state.abort();
    }

    /// Returns `true` if delivery has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.state.is_aborted()
    }

    /// Returns a cloneable handle that can abort this queue from elsewhere.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::new(self.state.abort_token())
    }

    /// Returns the queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the shared queue counters.
    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    fn open_sender(&self) -> Result<&mpsc::Sender<T>, QueueError> {
        if self.state.is_aborted() {
            return Err(QueueError::Aborted);
        }
        self.tx.as_ref().ok_or(QueueError::Completed)
    }

    fn reject(&self, item: T, reason: QueueError) -> Rejected<T> {
        self.metrics.record_rejected();
        Rejected::new(item, reason)
    }
}

/// Consumer half of a bounded queue.
///
/// Implements `Stream`; the stream ends once the writer completed adding (or
/// was dropped) and every queued item has been taken.
pub struct QueueReader<T> {
    rx: mpsc::Receiver<T>,
    metrics: Arc<QueueMetrics>,
}

impl<T: Send> QueueReader<T> {
    /// Takes the next item, waiting until one is available.
    ///
    /// Returns `None` when the queue is complete and empty. That is the
    /// normal end of a pass, not an error.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Takes the next item if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Returns the number of items currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    /// Returns `true` if no items are waiting.
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Returns the shared queue counters.
    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }
}

impl<T: Send> Stream for QueueReader<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let (writer, mut reader) = bounded::<u32>(8);
        for i in 0..5 {
            writer.add(i).await.unwrap();
        }
        for i in 0..5 {
            assert_eq!(reader.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn test_try_add_preserves_item_on_full() {
        let (writer, _reader) = bounded::<u32>(2);
        writer.try_add(1).unwrap();
        writer.try_add(2).unwrap();

        let rejected = writer.try_add(3).unwrap_err();
        assert_eq!(rejected.reason, QueueError::Full);
        assert_eq!(rejected.item, 3);
    }

    #[tokio::test]
    async fn test_complete_adding_ends_stream_after_drain() {
        let (mut writer, mut reader) = bounded::<u32>(4);
        writer.add(1).await.unwrap();
        writer.add(2).await.unwrap();
        writer.complete_adding();

        assert_eq!(reader.recv().await, Some(1));
        assert_eq!(reader.recv().await, Some(2));
        assert_eq!(reader.recv().await, None);
        // Taking again from a completed, empty queue is still a clean end.
        assert_eq!(reader.recv().await, None);
    }

    #[tokio::test]
    async fn test_add_after_complete_is_rejected() {
        let (mut writer, _reader) = bounded::<u32>(4);
        writer.complete_adding();
        writer.complete_adding();

        let rejected = writer.add(9).await.unwrap_err();
        assert_eq!(rejected.reason, QueueError::Completed);
        assert_eq!(rejected.item, 9);
    }

    #[tokio::test]
    async fn test_abort_wakes_blocked_producer() {
        let (writer, mut reader) = bounded::<u32>(1);
        writer.add(1).await.unwrap();

        let abort = writer.abort_handle();
        let blocked = tokio::spawn(async move {
            let result = writer.add(2).await;
            (writer, result)
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());

        abort.abort();
        let (writer, result) = blocked.await.unwrap();
        let rejected = result.unwrap_err();
        assert_eq!(rejected.reason, QueueError::Aborted);
        assert_eq!(rejected.item, 2);
        assert_eq!(writer.metrics().rejected(), 1);

        // The item queued before the abort is still there.
        assert_eq!(reader.recv().await, Some(1));
    }

    #[tokio::test]
    async fn test_blocking_add_from_sync_thread_waits_for_room() {
        let (mut writer, mut reader) = bounded::<u32>(1);
        let producer = std::thread::spawn(move || {
            writer.blocking_add(1).unwrap();
            // Full until the reader takes the first item.
            writer.blocking_add(2).unwrap();
            writer.complete_adding();
            writer.metrics().enqueued()
        });

        assert_eq!(reader.recv().await, Some(1));
        assert_eq!(reader.recv().await, Some(2));
        assert_eq!(reader.recv().await, None);
        assert_eq!(producer.join().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_blocking_add_rejects_when_closed() {
        let (writer, reader) = bounded::<u32>(1);
        let mut writer = tokio::task::spawn_blocking(move || {
            drop(reader);
            let rejected = writer.blocking_add(7).unwrap_err();
            assert_eq!(rejected.reason, QueueError::ConsumerGone);
            assert_eq!(rejected.item, 7);
            writer
        })
        .await
        .unwrap();

        writer.complete_adding();
        let rejected = tokio::task::spawn_blocking(move || writer.blocking_add(8))
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(rejected.reason, QueueError::Completed);
    }

    #[tokio::test]
    async fn test_reader_gone_rejects() {
        let (writer, reader) = bounded::<u32>(1);
        drop(reader);

        let rejected = writer.add(5).await.unwrap_err();
        assert_eq!(rejected.reason, QueueError::ConsumerGone);
    }
}
