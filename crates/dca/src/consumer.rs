use crate::event::IndexedEvent;
use crate::event_index::EventIndex;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Error reported by a consumer callback.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The destination is temporarily unavailable; the same call may succeed later.
    #[error("transient consumer failure: {0}")]
    Transient(String),
    /// The call will not succeed if repeated.
    #[error("consumer failure: {0}")]
    Failed(String),
    #[error("consumer I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConsumerError {
    /// Returns `true` if repeating the call may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ConsumerError::Transient(_) => true,
            ConsumerError::Failed(_) => false,
            ConsumerError::Io(e) => crate::retry::io_retry_decision(e) == crate::retry::RetryDecision::Retry,
        }
    }
}

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A destination for the decoded event stream.
///
/// Every pass over a trace file is bracketed by
/// `on_processing_period_start`/`on_processing_period_stop`, so a consumer
/// can flush and checkpoint at the end of the pass. Between the two, the
/// fan-out calls `on_event` for each event past the position the consumer
/// reported through `max_index_already_processed` when the pass started.
///
/// A consumer owns its resume positions. The pipeline reads them; it never
/// writes them.
///
/// Uses native async fn in traits. For dynamic dispatch, use
/// `Arc<dyn TraceConsumerBoxed>`.
pub trait TraceConsumer: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn on_processing_period_start(
        &self,
        trace_file: &str,
        is_active_file: bool,
        subfolder: &str,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send {
        let _ = (trace_file, is_active_file, subfolder);
        async { Ok(()) }
    }

    /// Handles one event. `subfolder` is the tag the pass was started with.
    fn on_event(&self, event: &IndexedEvent, subfolder: &str) -> impl Future<Output = Result<(), ConsumerError>> + Send;

    fn on_processing_period_stop(
        &self,
        trace_file: &str,
        is_active_file: bool,
        subfolder: &str,
    ) -> impl Future<Output = Result<(), ConsumerError>> + Send {
        let _ = (trace_file, is_active_file, subfolder);
        async { Ok(()) }
    }

    /// Highest index of `trace_file` this consumer has fully handled, or
    /// [`EventIndex::BEGINNING`].
    fn max_index_already_processed(&self, trace_file: &str) -> EventIndex;
}

/// Object-safe version of [`TraceConsumer`].
pub trait TraceConsumerBoxed: Send + Sync {
    fn name(&self) -> &str;

    fn on_processing_period_start_boxed<'a>(
        &'a self,
        trace_file: &'a str,
        is_active_file: bool,
        subfolder: &'a str,
    ) -> BoxFuture<'a, Result<(), ConsumerError>>;

    fn on_event_boxed<'a>(&'a self, event: &'a IndexedEvent, subfolder: &'a str) -> BoxFuture<'a, Result<(), ConsumerError>>;

    fn on_processing_period_stop_boxed<'a>(
        &'a self,
        trace_file: &'a str,
        is_active_file: bool,
        subfolder: &'a str,
    ) -> BoxFuture<'a, Result<(), ConsumerError>>;

    fn max_index_already_processed(&self, trace_file: &str) -> EventIndex;
}

impl<T: TraceConsumer> TraceConsumerBoxed for T {
    fn name(&self) -> &str {
        TraceConsumer::name(self)
    }

    fn on_processing_period_start_boxed<'a>(
        &'a self,
        trace_file: &'a str,
        is_active_file: bool,
        subfolder: &'a str,
    ) -> BoxFuture<'a, Result<(), ConsumerError>> {
        Box::pin(self.on_processing_period_start(trace_file, is_active_file, subfolder))
    }

    fn on_event_boxed<'a>(&'a self, event: &'a IndexedEvent, subfolder: &'a str) -> BoxFuture<'a, Result<(), ConsumerError>> {
        Box::pin(self.on_event(event, subfolder))
    }

    fn on_processing_period_stop_boxed<'a>(
        &'a self,
        trace_file: &'a str,
        is_active_file: bool,
        subfolder: &'a str,
    ) -> BoxFuture<'a, Result<(), ConsumerError>> {
        Box::pin(self.on_processing_period_stop(trace_file, is_active_file, subfolder))
    }

    fn max_index_already_processed(&self, trace_file: &str) -> EventIndex {
        TraceConsumer::max_index_already_processed(self, trace_file)
    }
}
