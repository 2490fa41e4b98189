//! Retry framework for operations against resources that fail transiently.
//!
//! Every call site shares one shape: run the action, ask a policy whether the
//! failure is worth another attempt, back off, log, and hand the *original*
//! error back once the policy says abort or the attempt budget is spent.
//!
//! - [`perform_with_retries`]: synchronous actions (blocking sleep between attempts)
//! - [`perform_with_retries_async`]: async actions (`tokio::time::sleep`)
//! - [`perform_io_with_retries`] / [`perform_io_with_retries_async`]: `std::io`
//!   operations with the built-in transient classification
//! - [`RetryingConsumer`]: decorator retrying a consumer's per-event callback

use crate::consumer::{ConsumerError, TraceConsumer};
use crate::event::IndexedEvent;
use crate::event_index::EventIndex;
use rand::Rng;
use serde::Deserialize;
use std::fmt;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, warn};

// =============================================================================
// POLICY
// =============================================================================

/// What to do with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// The failure is transient; try again if the budget allows.
    Retry,
    /// The failure is permanent; give up now.
    Abort,
}

/// Classifies failures into [`RetryDecision`]s.
///
/// Any `Fn(&E) -> RetryDecision` closure is a policy.
pub trait RetryPolicy<E: ?Sized> {
    fn classify(&self, error: &E) -> RetryDecision;
}

impl<E: ?Sized, F> RetryPolicy<E> for F
where
    F: Fn(&E) -> RetryDecision,
{
    fn classify(&self, error: &E) -> RetryDecision {
        self(error)
    }
}

/// Policy that retries every failure until the budget runs out.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<E: ?Sized> RetryPolicy<E> for AlwaysRetry {
    fn classify(&self, _error: &E) -> RetryDecision {
        RetryDecision::Retry
    }
}

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Attempt budget and backoff.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(with = "crate::config::millis")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(with = "crate::config::millis")]
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in `[0.5, 1.0)`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryConfig {
    /// No delay between attempts; useful for tests and in-memory resources.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Delay before retry number `retry` (1-indexed).
    fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_nanos = self.initial_delay.as_nanos() as f64 * self.backoff_multiplier.powi(exponent);
        let delay = if base_nanos >= self.max_delay.as_nanos() as f64 {
            self.max_delay
        } else {
            Duration::from_nanos(base_nanos.max(0.0) as u64)
        };
        if self.jitter && !delay.is_zero() {
            delay.mul_f64(rand::thread_rng().gen_range(0.5..1.0))
        } else {
            delay
        }
    }
}

// =============================================================================
// EXECUTORS
// =============================================================================

/// Outcome of a failed attempt, after consulting the policy.
enum Next {
    RetryAfter(Duration),
    GiveUp,
}

fn on_failure<C, E, P>(context: &C, error: &E, attempt: u32, policy: &P, config: &RetryConfig) -> Next
where
    C: fmt::Debug + ?Sized,
    E: fmt::Display,
    P: RetryPolicy<E>,
{
    let max_attempts = config.attempts();
    debug_assert!(attempt <= max_attempts);

    match policy.classify(error) {
        RetryDecision::Abort => {
            error!(?context, attempt, %error, "operation failed permanently; aborting");
            Next::GiveUp
        }
        RetryDecision::Retry if attempt >= max_attempts => {
            error!(?context, attempts = attempt, %error, "operation still failing; retry budget exhausted");
            Next::GiveUp
        }
        RetryDecision::Retry => {
            let delay = config.delay_for_retry(attempt);
            debug_assert!(delay <= config.max_delay);
            warn!(
                ?context,
                attempt,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                %error,
                "operation failed; retrying"
            );
            Next::RetryAfter(delay)
        }
    }
}

/// Runs `action` on `context` until it succeeds, the policy aborts, or
/// `config.max_attempts` attempts have been made.
///
/// On give-up the error of the last attempt is returned unchanged. Sleeps
/// block the calling thread; use [`perform_with_retries_async`] on the runtime.
///
/// # Example
///
/// ```ignore
/// let folder = perform_with_retries(
///     "fabric-trace",
///     |session| resolver.resolve_blocking(session),
///     &|e: &ResolveError| if e.is_transient() { RetryDecision::Retry } else { RetryDecision::Abort },
///     &RetryConfig::default(),
/// )?;
/// ```
pub fn perform_with_retries<C, T, E, F, P>(context: &C, mut action: F, policy: &P, config: &RetryConfig) -> Result<T, E>
where
    C: fmt::Debug + ?Sized,
    E: fmt::Display,
    F: FnMut(&C) -> Result<T, E>,
    P: RetryPolicy<E>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match action(context) {
            Ok(value) => return Ok(value),
            Err(e) => match on_failure(context, &e, attempt, policy, config) {
                Next::GiveUp => return Err(e),
                Next::RetryAfter(delay) => {
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            },
        }
    }
}

/// Async counterpart of [`perform_with_retries`].
pub async fn perform_with_retries_async<'a, C, T, E, F, Fut, P>(
    context: &'a C,
    mut action: F,
    policy: &P,
    config: &RetryConfig,
) -> Result<T, E>
where
    C: fmt::Debug + ?Sized,
    E: fmt::Display,
    F: FnMut(&'a C) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: RetryPolicy<E>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match action(context).await {
            Ok(value) => return Ok(value),
            Err(e) => match on_failure(context, &e, attempt, policy, config) {
                Next::GiveUp => return Err(e),
                Next::RetryAfter(delay) => {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            },
        }
    }
}

/// Transient I/O conditions: interrupted calls, busy handles, timeouts, and
/// sharing violations (surfaced as `PermissionDenied` on some platforms).
pub fn io_retry_decision(error: &io::Error) -> RetryDecision {
    match error.kind() {
        io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::PermissionDenied => RetryDecision::Retry,
        _ => RetryDecision::Abort,
    }
}

/// [`perform_with_retries`] for `std::io` operations.
pub fn perform_io_with_retries<C, T, F>(context: &C, action: F, config: &RetryConfig) -> io::Result<T>
where
    C: fmt::Debug + ?Sized,
    F: FnMut(&C) -> io::Result<T>,
{
    perform_with_retries(context, action, &io_retry_decision, config)
}

/// [`perform_with_retries_async`] for `std::io` operations.
pub async fn perform_io_with_retries_async<'a, C, T, F, Fut>(context: &'a C, action: F, config: &RetryConfig) -> io::Result<T>
where
    C: fmt::Debug + ?Sized,
    F: FnMut(&'a C) -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    perform_with_retries_async(context, action, &io_retry_decision, config).await
}

// =============================================================================
// RETRYING CONSUMER
// =============================================================================

/// A consumer wrapper that retries transient per-event failures.
///
/// Permanent failures and exhausted budgets surface the original
/// [`ConsumerError`], which the fan-out logs before moving on.
///
/// # Example
///
/// ```ignore
/// // `table_uploader` answers throttling with `ConsumerError::Transient`.
/// let upload = RetryingConsumer::new(table_uploader, RetryConfig::default());
/// registry.register(PluginKind::AzureTableQueryableEventUploader, upload)?;
/// ```
pub struct RetryingConsumer<C> {
    inner: C,
    config: RetryConfig,
    total_retries: AtomicU64,
}

impl<C: TraceConsumer> RetryingConsumer<C> {
    pub fn new(inner: C, config: RetryConfig) -> Self {
        Self {
            inner,
            config,
            total_retries: AtomicU64::new(0),
        }
    }

    /// Number of per-event retries made so far.
    pub fn total_retries(&self) -> u64 {
        self.total_retries.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: TraceConsumer> TraceConsumer for RetryingConsumer<C> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn on_processing_period_start(&self, trace_file: &str, is_active_file: bool, subfolder: &str) -> Result<(), ConsumerError> {
        self.inner
            .on_processing_period_start(trace_file, is_active_file, subfolder)
            .await
    }

    async fn on_event(&self, event: &IndexedEvent, subfolder: &str) -> Result<(), ConsumerError> {
        let policy = |e: &ConsumerError| {
            if e.is_transient() {
                RetryDecision::Retry
            } else {
                RetryDecision::Abort
            }
        };
        let context = (self.inner.name(), event.index);
        let mut attempts = 0u64;
        let result = perform_with_retries_async(
            &context,
            |_| {
                attempts += 1;
                self.inner.on_event(event, subfolder)
            },
            &policy,
            &self.config,
        )
        .await;
        // Only calls after the first one are retries.
        self.total_retries
            .fetch_add(attempts.saturating_sub(1), Ordering::Relaxed);
        result
    }

    async fn on_processing_period_stop(&self, trace_file: &str, is_active_file: bool, subfolder: &str) -> Result<(), ConsumerError> {
        self.inner
            .on_processing_period_stop(trace_file, is_active_file, subfolder)
            .await
    }

    fn max_index_already_processed(&self, trace_file: &str) -> EventIndex {
        self.inner.max_index_already_processed(trace_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tracing_test::traced_test;

    #[derive(Debug, PartialEq, Eq)]
    enum Flaky {
        NotReady(u32),
        Broken,
    }

    impl fmt::Display for Flaky {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Flaky::NotReady(n) => write!(f, "handle not ready (attempt {n})"),
                Flaky::Broken => f.write_str("handle broken"),
            }
        }
    }

    fn transient_only(e: &Flaky) -> RetryDecision {
        match e {
            Flaky::NotReady(_) => RetryDecision::Retry,
            Flaky::Broken => RetryDecision::Abort,
        }
    }

    #[test]
    #[traced_test]
    fn test_succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let result = perform_with_retries(
            "session-a",
            |_| {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err(Flaky::NotReady(calls.get()))
                } else {
                    Ok("folder")
                }
            },
            &transient_only,
            &RetryConfig::immediate(5),
        );

        assert_eq!(result, Ok("folder"));
        assert_eq!(calls.get(), 3);
        assert!(logs_contain("operation failed; retrying"));
        assert!(logs_contain("handle not ready (attempt 2)"));
    }

    #[test]
    #[traced_test]
    fn test_always_retry_stops_at_budget_with_original_error() {
        let calls = Cell::new(0u32);
        let result: Result<(), Flaky> = perform_with_retries(
            "session-b",
            |_| {
                calls.set(calls.get() + 1);
                Err(Flaky::NotReady(calls.get()))
            },
            &AlwaysRetry,
            &RetryConfig::immediate(4),
        );

        assert_eq!(calls.get(), 4);
        // The error of the last attempt, not a wrapper.
        assert_eq!(result, Err(Flaky::NotReady(4)));
        assert!(logs_contain("retry budget exhausted"));
    }

    #[test]
    #[traced_test]
    fn test_abort_is_not_retried() {
        let calls = Cell::new(0u32);
        let result: Result<(), Flaky> = perform_with_retries(
            "session-c",
            |_| {
                calls.set(calls.get() + 1);
                Err(Flaky::Broken)
            },
            &transient_only,
            &RetryConfig::immediate(10),
        );

        assert_eq!(calls.get(), 1);
        assert_eq!(result, Err(Flaky::Broken));
        assert!(logs_contain("operation failed permanently"));
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let calls = Cell::new(0u32);
        let _: Result<(), Flaky> = perform_with_retries(
            "x",
            |_| {
                calls.set(calls.get() + 1);
                Err(Flaky::NotReady(0))
            },
            &AlwaysRetry,
            &RetryConfig::immediate(0),
        );
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let config = RetryConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(350))
            .with_backoff_multiplier(2.0);
        assert_eq!(config.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_retry(3), Duration::from_millis(350));
        assert_eq!(config.delay_for_retry(30), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let config = RetryConfig::default()
            .with_initial_delay(Duration::from_millis(100))
            .with_jitter(true);
        for _ in 0..100 {
            let delay = config.delay_for_retry(1);
            assert!(delay >= Duration::from_millis(50) && delay <= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_async_waits_between_attempts() {
        let config = RetryConfig::default()
            .with_max_attempts(3)
            .with_initial_delay(Duration::from_secs(1));
        let calls = std::sync::atomic::AtomicU32::new(0);

        let start = tokio::time::Instant::now();
        let result: Result<(), Flaky> = perform_with_retries_async(
            "session-d",
            |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Err(Flaky::NotReady(n)) }
            },
            &AlwaysRetry,
            &config,
        )
        .await;

        assert_eq!(result, Err(Flaky::NotReady(3)));
        // 1s before the second attempt, 2s before the third.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    /// Answers every event with the same error.
    struct AlwaysFails {
        transient: bool,
        calls: std::sync::atomic::AtomicU32,
    }

    impl TraceConsumer for AlwaysFails {
        fn name(&self) -> &str {
            "always-fails"
        }

        async fn on_event(&self, _event: &IndexedEvent, _subfolder: &str) -> Result<(), ConsumerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.transient {
                Err(ConsumerError::Transient("server busy".into()))
            } else {
                Err(ConsumerError::Failed("schema rejected".into()))
            }
        }

        fn max_index_already_processed(&self, _trace_file: &str) -> EventIndex {
            EventIndex::BEGINNING
        }
    }

    fn event_at(ts: i64) -> IndexedEvent {
        let record = crate::event::DecodedRecord {
            timestamp: ts,
            task_name: Some("Hosting".into()),
            event_type: Some("ApplicationActivated".into()),
            level: 4,
            thread_id: 1,
            process_id: 2,
            text: "x".into(),
        };
        let event = crate::event::DecodedEvent::try_from_record(record).unwrap();
        IndexedEvent::new("trace_r.etl".into(), EventIndex::new(ts, 0), event)
    }

    #[tokio::test]
    async fn test_exhausted_budget_counts_only_real_retries() {
        let consumer = RetryingConsumer::new(
            AlwaysFails {
                transient: true,
                calls: std::sync::atomic::AtomicU32::new(0),
            },
            RetryConfig::immediate(3),
        );

        let result = consumer.on_event(&event_at(1), "Calc_App1").await;

        assert!(matches!(result, Err(ConsumerError::Transient(_))));
        assert_eq!(consumer.inner().calls.load(Ordering::SeqCst), 3);
        assert_eq!(consumer.total_retries(), 2);

        // A second exhausted event adds two more.
        let _ = consumer.on_event(&event_at(2), "Calc_App1").await;
        assert_eq!(consumer.total_retries(), 4);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_a_retry() {
        let consumer = RetryingConsumer::new(
            AlwaysFails {
                transient: false,
                calls: std::sync::atomic::AtomicU32::new(0),
            },
            RetryConfig::immediate(3),
        );

        let result = consumer.on_event(&event_at(1), "Calc_App1").await;

        assert!(matches!(result, Err(ConsumerError::Failed(_))));
        assert_eq!(consumer.inner().calls.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.total_retries(), 0);
    }

    #[test]
    fn test_io_classification() {
        assert_eq!(
            io_retry_decision(&io::Error::from(io::ErrorKind::Interrupted)),
            RetryDecision::Retry
        );
        assert_eq!(
            io_retry_decision(&io::Error::from(io::ErrorKind::PermissionDenied)),
            RetryDecision::Retry
        );
        assert_eq!(
            io_retry_decision(&io::Error::from(io::ErrorKind::NotFound)),
            RetryDecision::Abort
        );

        let calls = Cell::new(0u32);
        let result: io::Result<()> = perform_io_with_retries(
            std::path::Path::new("/cache/a.dtr"),
            |_| {
                calls.set(calls.get() + 1);
                Err(io::Error::from(io::ErrorKind::TimedOut))
            },
            &RetryConfig::immediate(2),
        );
        assert_eq!(calls.get(), 2);
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::TimedOut);
    }
}
