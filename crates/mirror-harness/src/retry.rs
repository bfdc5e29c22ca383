// Copyright (c) The Mirror Developers
// SPDX-License-Identifier: Apache-2.0

//! A small blocking retry primitive.
//!
//! Polling loops in the harness (readiness probes, container drain, volume
//! removal) all consume the same explicit policy value instead of carrying
//! their own ad hoc sleep loops.

use std::time::{Duration, Instant};

/// A bounded retry policy: at most `max_attempts` tries, a fixed pause
/// between them, and an optional overall wall-clock deadline.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
    pub deadline: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
            deadline: None,
        }
    }

    /// Caps the total time spent retrying, whichever of attempts or deadline
    /// runs out first.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Runs `op` until it succeeds or the policy is exhausted, returning the
    /// last error in the latter case.
    pub fn retry<T, E>(&self, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E> {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_attempts || self.expired(started) {
                        return Err(error);
                    }
                }
            }
            std::thread::sleep(self.backoff);
        }
    }

    /// Polls `predicate` until it returns true or the policy is exhausted.
    /// Returns whether the predicate was eventually satisfied.
    #[must_use]
    pub fn wait_until(&self, mut predicate: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            if predicate() {
                return true;
            }
            if attempt >= self.max_attempts || self.expired(started) {
                return false;
            }
            std::thread::sleep(self.backoff);
        }
    }

    fn expired(&self, started: Instant) -> bool {
        self.deadline
            .is_some_and(|deadline| started.elapsed() >= deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn returns_first_success() {
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let mut calls = 0;
        let result: Result<u32, &str> = policy.retry(|| {
            calls += 1;
            Ok(7)
        });
        assert_eq!(result, Ok(7));
        assert_eq!(calls, 1);
    }

    #[test]
    fn retries_until_attempts_exhausted() {
        let policy = RetryPolicy::new(4, Duration::ZERO);
        let mut calls = 0;
        let result: Result<(), u32> = policy.retry(|| {
            calls += 1;
            Err(calls)
        });
        assert_eq!(result, Err(4));
    }

    #[test]
    fn recovers_after_transient_failures() {
        let policy = RetryPolicy::new(5, Duration::ZERO);
        let mut calls = 0;
        let result: Result<u32, &str> = policy.retry(|| {
            calls += 1;
            if calls < 3 {
                Err("not yet")
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result, Ok(3));
    }

    #[test]
    fn wait_until_respects_deadline() {
        let policy = RetryPolicy::new(usize::MAX, Duration::from_millis(1))
            .with_deadline(Duration::from_millis(5));
        assert!(!policy.wait_until(|| false));
        assert!(policy.wait_until(|| true));
    }
}
