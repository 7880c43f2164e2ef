use rand::Rng;
use std::time::Duration;

use super::executor::Outcome;

#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter: bool) -> Self {
        Self { base, max, jitter }
    }

    pub fn max(&self) -> Duration {
        self.max
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let mut rng = rand::thread_rng();
        self.delay_with_rng(attempt, &mut rng)
    }

    pub fn delay_with_rng<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base_ms = self.base.as_millis().min(u128::from(u64::MAX)) as u64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as u64;
        let shift = attempt.min(16);
        let exp = base_ms.saturating_mul(1u64 << shift).min(max_ms);
        let delay_ms = if self.jitter {
            rng.gen_range(0..=exp)
        } else {
            exp
        };
        Duration::from_millis(delay_ms)
    }
}

/// What to do with an item after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Synced,
    Retry { after: Duration, reason: String },
    Fail { reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    backoff: Backoff,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(backoff: Backoff, max_attempts: u32) -> Self {
        Self {
            backoff,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// `attempts` counts the attempt that produced `outcome`.
    pub fn decide(&self, attempts: u32, outcome: &Outcome) -> Decision {
        match outcome {
            Outcome::Success => Decision::Synced,
            Outcome::PermanentFailure { reason } => Decision::Fail {
                reason: reason.clone(),
            },
            Outcome::RetryableFailure { reason, .. } if attempts >= self.max_attempts => {
                Decision::Fail {
                    reason: format!("gave up after {attempts} attempts: {reason}"),
                }
            }
            Outcome::RetryableFailure {
                reason,
                retry_after,
            } => {
                let delay = self.backoff.delay(attempts);
                let hinted = retry_after
                    .map(|hint| hint.min(self.backoff.max()))
                    .unwrap_or_default();
                Decision::Retry {
                    after: delay.max(hinted),
                    reason: reason.clone(),
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            Backoff::new(Duration::from_secs(1), Duration::from_secs(60), false),
            5,
        )
    }
}
