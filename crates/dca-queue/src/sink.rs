//! The per-item delivery callback and a closure adapter for it.

use std::fmt::Display;
use std::future::Future;

/// Per-item delivery callback driven by the consumer task.
///
/// The consumer task calls `deliver` once per queued item, in FIFO order,
/// passing the subfolder/context value the queue was started with. An error
/// is logged and counted by the consumer task; it does not stop delivery of
/// the items that follow.
///
/// Uses native async fn in traits with an explicit `Send` bound so the
/// consumer task can run on a multi-threaded runtime.
pub trait DeliverySink<T, C>: Send {
    /// Error reported for a failed delivery.
    type Error: Display + Send;

    /// Delivers one item.
    fn deliver(&mut self, item: T, context: &C) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Adapts a synchronous closure into a [`DeliverySink`].
///
/// # Example
///
/// ```ignore
/// let sink = FnSink::new(|n: u64, _ctx: &()| {
///     println!("{n}");
///     Ok::<(), std::io::Error>(())
/// });
/// ```
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F> {
    /// Wraps the closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }

    /// Returns the wrapped closure.
    pub fn into_inner(self) -> F {
        self.f
    }
}

impl<T, C, E, F> DeliverySink<T, C> for FnSink<F>
where
    T: Send,
    C: Sync,
    E: Display + Send,
    F: FnMut(T, &C) -> Result<(), E> + Send,
{
    type Error = E;

    fn deliver(&mut self, item: T, context: &C) -> impl Future<Output = Result<(), E>> + Send {
        std::future::ready((self.f)(item, context))
    }
}
