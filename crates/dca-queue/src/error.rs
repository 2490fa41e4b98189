//! Error types for delivery queue operations.

use std::fmt;
use thiserror::Error;

/// Errors that can occur in queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The queue is full and cannot accept more items right now.
    #[error("delivery queue is full")]
    Full,

    /// `complete_adding` was called; no more items are accepted.
    #[error("delivery queue is complete for adding")]
    Completed,

    /// Delivery for the current period was aborted.
    #[error("event delivery was aborted")]
    Aborted,

    /// The consumer task went away before the queue was drained.
    #[error("consumer task is gone")]
    ConsumerGone,

    /// The consumer task panicked while delivering items.
    #[error("consumer task panicked")]
    ConsumerPanicked,
}

impl QueueError {
    /// Returns `true` if retrying the same operation later may succeed.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Full)
    }

    /// Returns `true` if this error means the queue will never accept items again.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        !self.is_recoverable()
    }
}

/// An item the queue refused, handed back together with the reason.
///
/// The queue never drops an item it did not accept.
pub struct Rejected<T> {
    /// The item that was not enqueued.
    pub item: T,
    /// Why it was refused.
    pub reason: QueueError,
}

impl<T> Rejected<T> {
    pub(crate) fn new(item: T, reason: QueueError) -> Self {
        Self { item, reason }
    }

    /// Returns the refused item.
    pub fn into_inner(self) -> T {
        self.item
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rejected")
            .field("reason", &self.reason)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "item rejected: {}", self.reason)
    }
}

impl<T> std::error::Error for Rejected<T> {}
