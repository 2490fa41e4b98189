//! Configuration for delivery queue behavior.

/// Default number of slots in a delivery queue.
pub const DEFAULT_CAPACITY: usize = 1024;

/// Configuration for a buffered delivery queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryConfig {
    /// Number of items the queue holds before `add` starts waiting.
    ///
    /// Default: 1024
    pub capacity: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl DeliveryConfig {
    /// Creates a configuration with the given capacity.
    ///
    /// A capacity of zero is bumped to one; a zero-slot queue could never
    /// accept an item.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
        }
    }

    /// Creates a small queue suited to latency-sensitive consumers.
    pub fn low_latency() -> Self {
        Self::with_capacity(64)
    }

    /// Creates a large queue for high-volume trace files.
    pub fn high_throughput() -> Self {
        Self::with_capacity(16 * 1024)
    }
}
