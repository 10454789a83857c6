// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Retry decisions for failed batches.
//!
//! Each batch moves through `Pending -> InFlight -> {Success | RetryScheduled | Abandoned}`.
//! The delay before the retry that follows attempt `n` is
//!
//! ```text
//! min(max_retry_delay, retry_interval * exponential_base^(n-1) + jitter)
//! ```
//!
//! with `jitter` drawn uniformly from `[0, retry_jitter]`. A delay requested by the server
//! is a floor: the batch never goes out again sooner than asked.

use std::time::Duration;

use tokio::time::Instant;

use crate::config::PipelineConfig;
use crate::transport::MAX_RETRY_AFTER;

/// Per-batch bookkeeping while a batch is being delivered.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts started so far, including the one in flight.
    pub attempts: u32,
    pub first_attempt: Option<Instant>,
}

impl RetryState {
    /// Marks the batch in flight again.
    pub fn begin_attempt(&mut self, now: Instant) {
        self.attempts += 1;
        self.first_attempt.get_or_insert(now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay: Duration },
    Abandon,
}

#[derive(Debug, Clone)]
pub struct RetryController {
    max_retries: u32,
    retry_interval: Duration,
    exponential_base: u32,
    max_retry_delay: Duration,
    max_retry_time: Option<Duration>,
    retry_jitter: Duration,
}

impl RetryController {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_interval: config.retry_interval,
            exponential_base: config.exponential_base.max(1),
            max_retry_delay: config.max_retry_delay,
            max_retry_time: (!config.max_retry_time.is_zero()).then_some(config.max_retry_time),
            retry_jitter: config.retry_jitter,
        }
    }

    /// Jitter-free delay after the given attempt (1-based), capped at `max_retry_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.exponential_base).saturating_pow(exponent);
        let base_ms = u64::try_from(self.retry_interval.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_retry_delay.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Delay before the next attempt, jitter included, floored at `retry_after` (itself
    /// capped at [`MAX_RETRY_AFTER`]).
    pub fn next_delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let jitter_ms = u64::try_from(self.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        let computed = (self.backoff(attempt) + jitter).min(self.max_retry_delay);
        match retry_after {
            Some(requested) => computed.max(requested.min(MAX_RETRY_AFTER)),
            None => computed,
        }
    }

    /// Decides what happens to a batch whose latest attempt failed with a retryable error.
    ///
    /// With a retry time budget, a delay too large to represent as an instant abandons
    /// the batch.
    pub fn on_failure(
        &self,
        state: &RetryState,
        retry_after: Option<Duration>,
        now: Instant,
    ) -> RetryDecision {
        if state.attempts > self.max_retries {
            return RetryDecision::Abandon;
        }
        let delay = self.next_delay(state.attempts, retry_after);
        if let (Some(budget), Some(first)) = (self.max_retry_time, state.first_attempt) {
            let Some(next) = now.checked_add(delay) else {
                return RetryDecision::Abandon;
            };
            if first.checked_add(budget).is_some_and(|deadline| next > deadline) {
                return RetryDecision::Abandon;
            }
        }
        RetryDecision::Retry { delay }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn controller(max_retries: u32, jitter_ms: u64, max_retry_time_ms: u64) -> RetryController {
        RetryController::new(&PipelineConfig {
            max_retries,
            retry_interval: Duration::from_millis(100),
            exponential_base: 2,
            max_retry_delay: Duration::from_millis(1000),
            max_retry_time: Duration::from_millis(max_retry_time_ms),
            retry_jitter: Duration::from_millis(jitter_ms),
            ..Default::default()
        })
    }

    fn failed_after(attempts: u32, now: Instant) -> RetryState {
        RetryState {
            attempts,
            first_attempt: Some(now),
            ..Default::default()
        }
    }

    #[test]
    fn backoff_grows_exponentially_then_caps() {
        let retry = controller(10, 0, 0);
        let delays: Vec<u64> = (1..=6)
            .map(|a| retry.backoff(a).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn retry_after_is_a_floor() {
        let retry = controller(10, 0, 0);
        assert_eq!(
            retry.next_delay(1, Some(Duration::from_secs(3))),
            Duration::from_secs(3)
        );
        assert_eq!(
            retry.next_delay(3, Some(Duration::from_millis(10))),
            Duration::from_millis(400)
        );
    }

    #[test]
    fn abandons_once_attempts_exceed_max_retries() {
        let retry = controller(2, 0, 0);
        let now = Instant::now();
        assert_eq!(
            retry.on_failure(&failed_after(1, now), None, now),
            RetryDecision::Retry {
                delay: Duration::from_millis(100)
            }
        );
        assert!(matches!(
            retry.on_failure(&failed_after(2, now), None, now),
            RetryDecision::Retry { .. }
        ));
        assert_eq!(
            retry.on_failure(&failed_after(3, now), None, now),
            RetryDecision::Abandon
        );
    }

    #[test]
    fn zero_max_retries_never_retries() {
        let retry = controller(0, 0, 0);
        let now = Instant::now();
        assert_eq!(
            retry.on_failure(&failed_after(1, now), None, now),
            RetryDecision::Abandon
        );
    }

    #[test]
    fn abandons_when_retry_time_budget_is_spent() {
        let retry = controller(10, 0, 250);
        let start = Instant::now();
        let state = failed_after(1, start);
        assert!(matches!(
            retry.on_failure(&state, None, start),
            RetryDecision::Retry { .. }
        ));
        // 200ms elapsed plus a 100ms backoff overshoots the 250ms budget
        assert_eq!(
            retry.on_failure(&state, None, start + Duration::from_millis(200)),
            RetryDecision::Abandon
        );
    }

    #[test]
    fn huge_server_delay_abandons_within_budget() {
        let retry = controller(10, 0, 250);
        let now = Instant::now();
        assert_eq!(
            retry.on_failure(
                &failed_after(1, now),
                Some(Duration::from_secs(u64::MAX)),
                now
            ),
            RetryDecision::Abandon
        );
    }

    #[test]
    fn server_delay_is_capped() {
        let retry = controller(10, 0, 0);
        assert_eq!(
            retry.next_delay(1, Some(Duration::from_secs(u64::MAX))),
            MAX_RETRY_AFTER
        );
    }

    #[test]
    fn begin_attempt_keeps_first_attempt_time() {
        let mut state = RetryState::default();
        let start = Instant::now();
        state.begin_attempt(start);
        state.begin_attempt(start + Duration::from_secs(1));
        assert_eq!(state.attempts, 2);
        assert_eq!(state.first_attempt, Some(start));
    }

    proptest! {
        #[test]
        fn backoff_is_monotonic_and_bounded(attempt in 1u32..64) {
            let retry = controller(100, 0, 0);
            prop_assert!(retry.backoff(attempt) <= retry.backoff(attempt + 1));
            prop_assert!(retry.backoff(attempt) <= Duration::from_millis(1000));
        }

        #[test]
        fn jittered_delay_stays_within_bounds(attempt in 1u32..16, jitter in 0u64..500) {
            let retry = controller(100, jitter, 0);
            let delay = retry.next_delay(attempt, None);
            prop_assert!(delay >= retry.backoff(attempt));
            prop_assert!(delay <= Duration::from_millis(1000));
        }

        #[test]
        fn server_delay_lower_bounds_wait(attempt in 1u32..16, requested_ms in 0u64..5000) {
            let retry = controller(100, 50, 0);
            let requested = Duration::from_millis(requested_ms);
            prop_assert!(retry.next_delay(attempt, Some(requested)) >= requested);
        }
    }
}
