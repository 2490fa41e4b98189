//! Diagnostics Collection Agent core
//!
//! Reads decoded trace events from trace files and fans each one out to a set
//! of independently progressing consumers, keeping the local cache of
//! collected files trimmed against its upstream copy.
//!
//! One [`DecodePass`] handles one trace file: it filters the decoded records
//! through an optional [`EventFilter`], indexes them with [`EventIndexer`],
//! pushes them through a bounded [`BufferedDelivery`] queue and lets a
//! [`FanOut`] sink hand every event to each consumer whose resume position is
//! below the event's [`EventIndex`]. Passes over different
//! trace files share nothing mutable and run concurrently. A [`DeliveryRound`]
//! runs passes over a session's files, newest first, within a time budget.
//!
//! Transient failures anywhere in the agent go through the retry helpers in
//! [`retry`]; every pass ends with a [`PassRecord`] logged under the
//! `dca::perf` target.

pub mod config;
pub mod consumer;
pub mod consumers;
pub mod event;
pub mod event_index;
pub mod fanout;
pub mod filter;
pub mod logging;
pub mod pass;
pub mod paths;
pub mod perf;
pub mod plugin;
pub mod resume;
pub mod retry;
pub mod round;
pub mod session;
pub mod trim;

// Re-export main types
pub use config::{AgentConfig, ConfigError};
pub use consumer::{ConsumerError, TraceConsumer, TraceConsumerBoxed};
pub use consumers::{CsvFileConsumer, Delivery, MemoryConsumer, PeriodMark};
pub use event::{DecodedEvent, DecodedRecord, IndexedEvent, Level, MalformedEvent};
pub use event_index::{EventIndex, EventIndexer, ParseEventIndexError};
pub use fanout::{ConsumerStats, FanOut, FanOutError, ResumeCursors};
pub use filter::{EventFilter, FilterError};
pub use pass::{records, DecodeError, DecodePass, DecodeSource, IterSource, PassError, PassReport};
pub use perf::{PassCounters, PassKind, PassPerformance, PassRecord, ParsePassRecordError};
pub use plugin::{ActiveConsumer, ConsumerRegistry, PluginFlags, PluginKind, PluginRole, RegistryError};
pub use resume::{ResumeState, ResumeStateError};
pub use retry::{
    perform_io_with_retries, perform_io_with_retries_async, perform_with_retries, perform_with_retries_async,
    AlwaysRetry, RetryConfig, RetryDecision, RetryPolicy, RetryingConsumer,
};
pub use round::{list_trace_files, DeliveryRound, RoundReport, TraceFile};
pub use session::{DirectorySessionResolver, ResolveError, SessionFolderCache, SessionResolver};
pub use trim::{DeletionContext, FolderTrimmer, LocalUpstream, TrimConfig, TrimReport, UpstreamError, UpstreamIndex};

pub use dca_queue::{AbortHandle, BufferedDelivery, DeliveryConfig, DrainReport, QueueError, QueueMetrics};
