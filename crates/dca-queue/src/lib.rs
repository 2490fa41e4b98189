//! Buffered Delivery Queue
//!
//! A bounded FIFO channel that decouples a decode pass (the producer) from a
//! single consumer-processing task. The queue provides:
//!
//! - **Backpressure**: `add` waits while the queue is full, so a slow consumer
//!   throttles decoding instead of growing memory without bound
//! - **Graceful drain**: `complete_adding` lets the consumer finish every queued
//!   item before it exits; `wait_for_drain_completion` resolves after that
//! - **Abort**: stops further enqueues for the current period while items
//!   already queued still reach the consumer
//! - **Failure isolation**: a failing delivery callback is logged and counted,
//!   the loop moves on to the next item
//!
//! # Example
//!
//! ```ignore
//! use dca_queue::{BufferedDelivery, DeliveryConfig, FnSink};
//!
//! #[tokio::main]
//! async fn main() {
//!     let sink = FnSink::new(|line: String, subfolder: &String| {
//!         println!("[{subfolder}] {line}");
//!         Ok::<(), std::io::Error>(())
//!     });
//!     let mut delivery = BufferedDelivery::start(DeliveryConfig::default(), "App0".to_string(), sink);
//!
//!     delivery.add("first".to_string()).await.unwrap();
//!     delivery.add("second".to_string()).await.unwrap();
//!
//!     delivery.complete_adding();
//!     let report = delivery.wait_for_drain_completion().await.unwrap();
//!     assert_eq!(report.delivered, 2);
//! }
//! ```

mod config;
mod delivery;
mod error;
mod invariants;
mod metrics;
mod queue;
mod shutdown;
mod sink;

pub use config::DeliveryConfig;
pub use delivery::{BufferedDelivery, DrainReport};
pub use error::{QueueError, Rejected};
pub use metrics::QueueMetrics;
pub use queue::{bounded, QueueReader, QueueWriter};
pub use shutdown::AbortHandle;
pub use sink::{DeliverySink, FnSink};

// Re-export useful stream combinators
pub use tokio_stream::StreamExt;
