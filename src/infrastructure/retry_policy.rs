//! Retry state machine for outbound requests
//!
//! A request moves `Attempt -> Backoff -> Attempt ...` until it succeeds or
//! reaches `GiveUp`. The transitions are pure so the policy can be tested
//! without a network.

use std::time::Duration;

use crate::infrastructure::config::PipelineConfig;

/// How a single attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    /// 403 or 429: the exit IP is throttled
    Blocked,
    Timeout,
    /// Connection, DNS or proxy tunnel failure
    Transport,
    /// 5xx from the site itself
    ServerError,
    /// Anything a retry cannot fix (404, 401 ...)
    Permanent,
}

impl AttemptFailure {
    pub fn is_retryable(self) -> bool {
        !matches!(self, Self::Permanent)
    }

    /// Failures that point at the proxy endpoint rather than the site
    pub fn rotates_proxy(self) -> bool {
        matches!(self, Self::Blocked | Self::Timeout | Self::Transport)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Random extra delay of up to a quarter of the backoff
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_retries.max(1),
            base_backoff: Duration::from_millis(config.backoff_base_ms),
            max_backoff: Duration::from_millis(config.backoff_max_ms),
            jitter: true,
        }
    }

    /// Exponential backoff after the given failed attempt: base * 2^(attempt-1), capped
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_backoff.saturating_mul(1_u32 << exponent);
        let delay = delay.min(self.max_backoff);
        if self.jitter && !delay.is_zero() {
            let quarter = delay.as_millis() as u64 / 4;
            delay + Duration::from_millis(fastrand::u64(0..=quarter))
        } else {
            delay
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// About to send attempt number `n` (1-based)
    Attempt(u32),
    /// Waiting before attempt `next`
    Backoff {
        next: u32,
        delay: Duration,
        rotate_proxy: bool,
    },
    GiveUp {
        attempts: u32,
        last_failure: AttemptFailure,
    },
}

impl RetryState {
    pub fn start() -> Self {
        Self::Attempt(1)
    }

    /// Transition after the current attempt failed
    pub fn on_failure(self, policy: &RetryPolicy, failure: AttemptFailure) -> Self {
        let Self::Attempt(attempt) = self else {
            return self;
        };
        if !failure.is_retryable() || attempt >= policy.max_attempts {
            return Self::GiveUp {
                attempts: attempt,
                last_failure: failure,
            };
        }
        Self::Backoff {
            next: attempt + 1,
            delay: policy.backoff_after(attempt),
            rotate_proxy: failure.rotates_proxy(),
        }
    }

    /// Transition once the backoff delay has elapsed
    pub fn resume(self) -> Self {
        match self {
            Self::Backoff { next, .. } => Self::Attempt(next),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(250),
            jitter: false,
        }
    }

    #[test]
    fn blocked_attempts_back_off_and_rotate_until_exhausted() {
        let policy = policy();
        let state = RetryState::start().on_failure(&policy, AttemptFailure::Blocked);
        assert_eq!(
            state,
            RetryState::Backoff {
                next: 2,
                delay: Duration::from_millis(100),
                rotate_proxy: true
            }
        );

        let state = state.resume().on_failure(&policy, AttemptFailure::Blocked);
        assert_eq!(
            state,
            RetryState::Backoff {
                next: 3,
                delay: Duration::from_millis(200),
                rotate_proxy: true
            }
        );

        let state = state.resume().on_failure(&policy, AttemptFailure::Blocked);
        assert_eq!(
            state,
            RetryState::GiveUp {
                attempts: 3,
                last_failure: AttemptFailure::Blocked
            }
        );
    }

    #[test]
    fn permanent_failure_gives_up_immediately() {
        let state = RetryState::start().on_failure(&policy(), AttemptFailure::Permanent);
        assert!(matches!(state, RetryState::GiveUp { attempts: 1, .. }));
    }

    #[test]
    fn server_errors_retry_without_rotation() {
        let state = RetryState::start().on_failure(&policy(), AttemptFailure::ServerError);
        assert!(matches!(
            state,
            RetryState::Backoff {
                rotate_proxy: false,
                ..
            }
        ));
    }

    #[rstest]
    #[case(1, 100)]
    #[case(2, 200)]
    #[case(3, 250)]
    #[case(30, 250)]
    fn backoff_is_capped(#[case] attempt: u32, #[case] expected_ms: u64) {
        assert_eq!(policy().backoff_after(attempt), Duration::from_millis(expected_ms));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let policy = RetryPolicy {
            jitter: true,
            ..policy()
        };
        for _ in 0..100 {
            let delay = policy.backoff_after(1);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn terminal_states_are_sticky() {
        let give_up = RetryState::GiveUp {
            attempts: 2,
            last_failure: AttemptFailure::Timeout,
        };
        assert_eq!(give_up.resume(), give_up);
        assert_eq!(give_up.on_failure(&policy(), AttemptFailure::Timeout), give_up);
    }
}
