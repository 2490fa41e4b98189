//! Debug assertion macros for queue invariants.
//!
//! Only active in debug builds (`#[cfg(debug_assertions)]`), so release builds
//! pay nothing for them.

// =============================================================================
// Drain completeness
// =============================================================================

/// Assert that every enqueued item reached the callback exactly once by the
/// time the consumer task observed completion.
///
/// **Invariant**: `drained → delivered + failed == enqueued`
///
/// Used in: consumer task exit path
macro_rules! debug_assert_drained {
    ($enqueued:expr, $delivered:expr, $failed:expr) => {
        debug_assert_eq!(
            $enqueued,
            $delivered + $failed,
            "consumer exited with undelivered items"
        )
    };
}

#[allow(unused_imports)]
pub(crate) use debug_assert_drained;

#[cfg(test)]
mod tests {
    #[test]
    fn test_drained_passes() {
        debug_assert_drained!(10u64, 7u64, 3u64);
    }

    #[test]
    #[should_panic(expected = "undelivered items")]
    #[cfg(debug_assertions)]
    fn test_drained_fails() {
        debug_assert_drained!(10u64, 7u64, 2u64);
    }
}
