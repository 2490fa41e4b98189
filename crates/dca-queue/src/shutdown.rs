//! Completion and abort signalling shared by the writer and its handles.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio_util::sync::CancellationToken;

/// Shared lifecycle state of one queue.
#[derive(Debug)]
pub(crate) struct QueueState {
    /// Set once `complete_adding` has been called.
    completed: AtomicBool,
    /// Cancelled when delivery for the current period is aborted.
    abort: CancellationToken,
}

impl QueueState {
    pub(crate) fn new() -> Self {
        Self {
            completed: AtomicBool::new(false),
            abort: CancellationToken::new(),
        }
    }

    /// Marks the queue as complete for adding. Returns `true` on the first call.
    #[inline]
    pub(crate) fn complete(&self) -> bool {
        !self.completed.swap(true, Ordering::AcqRel)
    }

    #[inline]
    pub(crate) fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn abort(&self) {
        self.abort.cancel();
    }

    #[inline]
    pub(crate) fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves once the queue is aborted.
    pub(crate) async fn aborted(&self) {
        self.abort.cancelled().await;
    }

    pub(crate) fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }
}

/// A cloneable handle for aborting event delivery.
///
/// Consumers hold one of these to ask the pipeline to stop feeding them for
/// the current period. Aborting:
/// 1. Rejects every later `add` with `QueueError::Aborted`
/// 2. Wakes a producer blocked on a full queue, handing its item back
/// 3. Leaves items already queued in place so they still drain to the consumer
///
/// Only the first call has an effect; later calls are no-ops.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    token: CancellationToken,
}

impl AbortHandle {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Aborts delivery for the current period.
    pub fn abort(&self) {
        self.token.cancel();
    }

    /// Returns `true` if delivery has been aborted.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }
}
