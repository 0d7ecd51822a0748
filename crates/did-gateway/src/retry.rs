//! Retry/backoff engine.
//!
//! One budget of `max_retries + 1` attempts is shared by transport and
//! application failures. The delay before retry `n` is `base * 2^(n-1)`
//! plus uniform jitter of up to 10%.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::classify::{Failure, RetryCause, Verdict};
use crate::error::{GatewayError, GatewayResult};
use crate::types::TxReceipt;

/// Jitter as a fraction of the exponential delay.
const JITTER_FRACTION: f64 = 0.1;

/// Attempt budget and backoff base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base: Duration) -> Self {
        Self { max_retries, base }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Exponential delay before retry `n` (n >= 1), without jitter.
    pub fn base_delay(&self, n: u32) -> Duration {
        let exp = n.max(1) - 1;
        self.base.saturating_mul(2u32.saturating_pow(exp))
    }

    /// Delay before retry `n`, in `[base_delay(n), base_delay(n) * 1.1]`.
    pub fn delay(&self, n: u32) -> Duration {
        let delay = self.base_delay(n);
        let max_jitter = delay.as_secs_f64() * JITTER_FRACTION;
        let jitter = rand::thread_rng().gen_range(0.0..=max_jitter);
        delay.saturating_add(Duration::try_from_secs_f64(jitter).unwrap_or(Duration::ZERO))
    }

    /// Longest time a full run can take when every attempt uses up
    /// `attempt_timeout` and every backoff draws maximal jitter.
    ///
    /// `None` if that does not fit in a `Duration`.
    pub fn worst_case_run(&self, attempt_timeout: Duration) -> Option<Duration> {
        let mut total = attempt_timeout.checked_mul(self.max_attempts())?;
        if self.base.is_zero() {
            return Some(total);
        }
        for n in 1..=self.max_retries {
            let delay = self.base.checked_mul(2u32.checked_pow(n - 1)?)?;
            total = total.checked_add(delay)?.checked_add(delay / 10)?;
        }
        Some(total)
    }
}

/// Retry state machine.
///
/// `Idle -> Attempting -> {Succeeded, FailedRetryable -> Attempting, FailedFatal}`.
/// `Succeeded` and `FailedFatal` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    Idle,
    Attempting { attempt: u32 },
    Succeeded,
    FailedRetryable { attempt: u32 },
    FailedFatal,
}

impl RetryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedFatal)
    }

    fn can_transition_to(self, next: RetryState) -> bool {
        matches!(
            (self, next),
            (Self::Idle, Self::Attempting { .. })
                | (Self::FailedRetryable { .. }, Self::Attempting { .. })
                | (
                    Self::Attempting { .. },
                    Self::Succeeded | Self::FailedRetryable { .. } | Self::FailedFatal
                )
                | (Self::FailedRetryable { .. }, Self::FailedFatal)
        )
    }
}

/// Result of a single attempt, as seen by the engine.
#[derive(Debug)]
pub enum Step<T> {
    Done(T),
    Retry(RetryCause),
    Fail(GatewayError),
}

impl From<Verdict> for Step<TxReceipt> {
    fn from(verdict: Verdict) -> Self {
        match verdict {
            Verdict::Success(receipt) | Verdict::SuccessEquivalent(receipt) => Step::Done(receipt),
            Verdict::Retryable(cause) => Step::Retry(cause),
            Verdict::Fatal(err) => Step::Fail(err),
        }
    }
}

impl<T> From<Failure> for Step<T> {
    fn from(failure: Failure) -> Self {
        match failure {
            Failure::Retryable(cause) => Step::Retry(cause),
            Failure::Fatal(err) => Step::Fail(err),
        }
    }
}

/// Drives one logical operation through repeated attempts.
#[derive(Debug)]
pub struct RetryEngine {
    policy: RetryPolicy,
    state: RetryState,
    attempts: u32,
}

impl RetryEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            state: RetryState::Idle,
            attempts: 0,
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn transition(&mut self, next: RetryState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid retry transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }

    /// Run `op` until it is done, fails fatally, or the budget is spent.
    ///
    /// `op` receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&mut self, mut op: F) -> GatewayResult<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Step<T>>,
    {
        let max_attempts = self.policy.max_attempts();

        loop {
            let attempt = self.attempts + 1;
            self.attempts = attempt;
            self.transition(RetryState::Attempting { attempt });

            match op(attempt).await {
                Step::Done(value) => {
                    self.transition(RetryState::Succeeded);
                    return Ok(value);
                }
                Step::Fail(err) => {
                    self.transition(RetryState::FailedFatal);
                    return Err(err);
                }
                Step::Retry(cause) => {
                    self.transition(RetryState::FailedRetryable { attempt });

                    if attempt >= max_attempts {
                        self.transition(RetryState::FailedFatal);
                        return Err(cause.into_exhausted_error(attempt));
                    }

                    let backoff = self.policy.delay(attempt);
                    debug!(
                        attempt,
                        max_retries = self.policy.max_retries,
                        backoff_ms = backoff.as_millis() as u64,
                        error = cause.message(),
                        "backing off before retry"
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
