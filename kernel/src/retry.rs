// Retry With Exponential Backoff
//
// Single point where transient/fatal classification and backoff
// happen. The wrapped operation must be safe to re-execute: the
// revision check on appends and the resumable position on reads are
// what make retries idempotent, not this module.

use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::log::StoreError;

/// Backoff parameters for one class of operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; doubled after each one.
    pub initial_delay: Duration,
    /// Total tries including the first. Zero behaves as one.
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub const fn new(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_attempts,
        }
    }

    /// Default for appends: 500 ms initial delay, 5 attempts.
    pub const fn append_default() -> Self {
        Self::new(Duration::from_millis(500), 5)
    }

    /// Default for reads: 500 ms initial delay, 10 attempts.
    pub const fn read_default() -> Self {
        Self::new(Duration::from_millis(500), 10)
    }
}

/// Run `op`, retrying transient failures with exponential backoff.
///
/// A failure that `is_transient` rejects, or that occurs on the last
/// permitted attempt, surfaces unchanged; nothing is wrapped or
/// swallowed. `on_retry` observes each scheduled retry with the
/// failure, the 1-based attempt index that failed, and the delay
/// about to be slept.
pub fn execute<T, E, Op, Classify, Trace>(
    policy: &RetryPolicy,
    mut op: Op,
    is_transient: Classify,
    mut on_retry: Trace,
) -> Result<T, E>
where
    Op: FnMut() -> Result<T, E>,
    Classify: Fn(&E) -> bool,
    Trace: FnMut(&E, u32, Duration),
{
    let mut remaining = policy.max_attempts.max(1);
    let mut delay = policy.initial_delay;
    let mut attempt = 0u32;

    loop {
        remaining -= 1;
        attempt += 1;
        match op() {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !is_transient(&error) || remaining == 0 {
                    return Err(error);
                }
                on_retry(&error, attempt, delay);
                thread::sleep(delay);
                delay += delay;
            }
        }
    }
}

/// [`execute`] bound to the store's transient classification, logging
/// each retry.
pub fn execute_transient<T, Op>(policy: &RetryPolicy, op: Op) -> Result<T, StoreError>
where
    Op: FnMut() -> Result<T, StoreError>,
{
    execute(policy, op, StoreError::is_transient, |error, attempt, delay| {
        warn!(%error, attempt, ?delay, "transient failure, retrying");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(Duration::from_micros(50), max_attempts)
    }

    #[test]
    fn always_transient_runs_exactly_max_attempts_with_growing_delays() {
        let mut calls = 0u32;
        let mut delays = Vec::new();

        let result: Result<(), StoreError> = execute(
            &fast(5),
            || {
                calls += 1;
                Err(StoreError::NotLeader)
            },
            |_| true,
            |_, _, delay| delays.push(delay),
        );

        assert_eq!(result, Err(StoreError::NotLeader));
        assert_eq!(calls, 5);
        assert_eq!(delays.len(), 4);
        for pair in delays.windows(2) {
            assert!(pair[1] >= pair[0]);
        }
        assert_eq!(delays[1], delays[0] * 2);
    }

    #[test]
    fn fatal_errors_surface_immediately_and_unchanged() {
        let mut calls = 0u32;
        let result: Result<(), StoreError> = execute_transient(&fast(5), || {
            calls += 1;
            Err(StoreError::MalformedRequest("bad".into()))
        });

        assert_eq!(result, Err(StoreError::MalformedRequest("bad".into())));
        assert_eq!(calls, 1);
    }

    #[test]
    fn recovers_after_transient_failures() {
        let mut calls = 0u32;
        let result = execute_transient(&fast(5), || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::Transport("reset".into()))
            } else {
                Ok(calls)
            }
        });

        assert_eq!(result, Ok(3));
    }

    #[test]
    fn zero_attempts_still_tries_once() {
        let mut calls = 0u32;
        let result: Result<u32, StoreError> = execute_transient(&fast(0), || {
            calls += 1;
            Ok(calls)
        });

        assert_eq!(result, Ok(1));
        assert_eq!(calls, 1);
    }
}
