//! Backoff decisions: which failures are retried, and after how long.
//!
//! Two exponential profiles with jitter share one attempt cap. The random
//! source is injectable so delay bounds can be checked deterministically.

use std::time::Duration;

use crate::config::RetryConfig;

use super::failure::{Failure, FailureClass};

/// Largest exponent ever applied; `1 << 31` still fits a `u32` multiplier.
const MAX_EXPONENT: u32 = 31;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Do not retry this error.
    NoRetry,
    /// Retry after the given delay.
    RetryAfter(Duration),
}

/// Per-operation retry state. Created fresh for each logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryContext {
    /// 1-based number of the attempt that just failed.
    pub attempt: u32,
    /// Whether the caller declared the operation safe to repeat.
    pub idempotent: bool,
}

impl RetryContext {
    pub fn new(idempotent: bool) -> Self {
        Self {
            attempt: 1,
            idempotent,
        }
    }

    pub fn advance(&mut self) {
        self.attempt = self.attempt.saturating_add(1);
    }
}

/// Exponential backoff profile: `base * 2^attempt`, capped at `cap`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    /// Smallest exponent at which `base * 2^exp` reaches `cap`.
    ceiling: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        let mut ceiling = 0;
        if !base.is_zero() {
            while ceiling < MAX_EXPONENT && base.saturating_mul(1 << ceiling) < cap {
                ceiling += 1;
            }
        }
        Self { base, cap, ceiling }
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn cap(&self) -> Duration {
        self.cap
    }

    /// `min(cap, base * 2^attempt)` without overflow.
    pub fn upper_bound(&self, attempt: u32) -> Duration {
        let exp = attempt.min(self.ceiling);
        self.base.saturating_mul(1 << exp).min(self.cap)
    }

    /// Uniform in `[0, upper_bound(attempt)]`.
    pub fn full_jitter(&self, attempt: u32, rng: &mut fastrand::Rng) -> Duration {
        random_up_to(self.upper_bound(attempt), rng)
    }

    /// Half the bound plus a uniform share of the other half.
    pub fn equal_jitter(&self, attempt: u32, rng: &mut fastrand::Rng) -> Duration {
        let half = self.upper_bound(attempt) / 2;
        half + random_up_to(half, rng)
    }
}

fn random_up_to(max: Duration, rng: &mut fastrand::Rng) -> Duration {
    let nanos = u64::try_from(max.as_nanos()).unwrap_or(u64::MAX);
    Duration::from_nanos(rng.u64(0..=nanos))
}

/// Dual-profile backoff policy.
///
/// The fast profile serves transient unavailability and undetermined outcomes;
/// the slow profile serves overload, where the server explicitly asked for
/// less traffic. Session conflicts retry immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    fast: Backoff,
    slow: Backoff,
    /// Maximum number of attempts (including the first).
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(fast: Backoff, slow: Backoff, max_attempts: u32) -> Self {
        Self {
            fast,
            slow,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(cfg: &RetryConfig) -> Self {
        Self::new(
            Backoff::new(
                Duration::from_millis(cfg.fast_base_ms),
                Duration::from_millis(cfg.fast_cap_ms),
            ),
            Backoff::new(
                Duration::from_millis(cfg.slow_base_ms),
                Duration::from_millis(cfg.slow_cap_ms),
            ),
            cfg.max_attempts,
        )
    }

    /// Policy used by the pool to create sessions: the same backoff profiles,
    /// but a small attempt budget independent of the one for user operations.
    pub fn for_session_creation(cfg: &RetryConfig, attempts: u32) -> Self {
        Self::from_config(cfg).with_max_attempts(attempts)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn fast(&self) -> &Backoff {
        &self.fast
    }

    pub fn slow(&self) -> &Backoff {
        &self.slow
    }

    /// Decide whether and when to retry, using thread-local randomness.
    pub fn decide(&self, failure: &Failure<'_>, ctx: &RetryContext) -> RetryDecision {
        let mut rng = fastrand::Rng::new();
        self.decide_with(failure, ctx, &mut rng)
    }

    /// Decide whether and when to retry.
    ///
    /// `ctx.attempt` is 1-based (1 = first attempt just failed).
    pub fn decide_with(
        &self,
        failure: &Failure<'_>,
        ctx: &RetryContext,
        rng: &mut fastrand::Rng,
    ) -> RetryDecision {
        if ctx.attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }

        match failure.class() {
            FailureClass::SessionConflict => RetryDecision::RetryAfter(Duration::ZERO),
            FailureClass::Undetermined if ctx.idempotent => {
                RetryDecision::RetryAfter(self.fast.full_jitter(ctx.attempt, rng))
            }
            FailureClass::Unavailable => {
                RetryDecision::RetryAfter(self.fast.equal_jitter(ctx.attempt, rng))
            }
            FailureClass::Overloaded => {
                RetryDecision::RetryAfter(self.slow.equal_jitter(ctx.attempt, rng))
            }
            FailureClass::Undetermined | FailureClass::NonRetryable => RetryDecision::NoRetry,
        }
    }
}
