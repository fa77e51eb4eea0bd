//! Bounded polling with capped exponential backoff and jitter.
//!
//! Time is read and spent through a [`Clock`], so the whole schedule can be
//! driven by a fake clock in tests.

use rand::Rng;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub trait Clock {
    /// Time passed since the clock was created.
    fn elapsed(&self) -> Duration;
    fn sleep(&mut self, duration: Duration);
}

pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&mut self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub max_attempts: u32,
    /// Wall-clock budget for the whole poll, sleeps included.
    pub budget: Duration,
    /// Extra random delay as a fraction of the computed delay, in `[0, 1]`.
    pub jitter: f64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            max_interval: Duration::from_secs(120),
            max_attempts: 40,
            budget: Duration::from_secs(30 * 60),
            jitter: 0.2,
        }
    }
}

impl PollPolicy {
    /// Delay before attempt `attempt + 1`, jitter not included:
    /// `min(interval * 2^(attempt-1), max_interval)`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u32 << exponent;
        self.interval
            .checked_mul(factor)
            .unwrap_or(self.max_interval)
            .min(self.max_interval)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let fraction = rand::thread_rng().gen_range(0.0..=jitter);
        delay + delay.mul_f64(fraction)
    }

    /// The same policy with its budget cut down to `remaining`.
    pub fn capped_at(&self, remaining: Duration) -> Self {
        Self {
            budget: self.budget.min(remaining),
            ..self.clone()
        }
    }
}

/// What one status check saw.
#[derive(Debug, Clone, PartialEq)]
pub enum Check<T> {
    Ready(T),
    Failed(String),
    Pending(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome<T> {
    Completed { value: T, attempts: u32 },
    Failed { status: String, attempts: u32 },
    TimedOut { attempts: u32, elapsed: Duration },
}

/// Calls `check` until it reports ready or failed, or attempts or budget run
/// out. A check that errors is logged and still counts as an attempt.
///
/// `check` receives the 1-based attempt number.
pub fn poll<T, C, F>(policy: &PollPolicy, clock: &mut C, mut check: F) -> PollOutcome<T>
where
    C: Clock + ?Sized,
    F: FnMut(u32) -> anyhow::Result<Check<T>>,
{
    let start = clock.elapsed();
    let spent = |clock: &C| clock.elapsed().saturating_sub(start);
    let mut attempts = 0;

    while attempts < policy.max_attempts {
        if attempts > 0 {
            let remaining = policy.budget.saturating_sub(spent(clock));
            if remaining.is_zero() {
                break;
            }
            let delay = policy.jittered(policy.backoff(attempts)).min(remaining);
            debug!("Next status check in {:.1}s", delay.as_secs_f64());
            clock.sleep(delay);
        }

        attempts += 1;
        match check(attempts) {
            Ok(Check::Ready(value)) => return PollOutcome::Completed { value, attempts },
            Ok(Check::Failed(status)) => return PollOutcome::Failed { status, attempts },
            Ok(Check::Pending(status)) => {
                debug!("Attempt {}/{}: still '{}'", attempts, policy.max_attempts, status);
            }
            Err(e) => warn!("Attempt {}/{}: status check failed: {:#}", attempts, policy.max_attempts, e),
        }

        if spent(clock) >= policy.budget {
            break;
        }
    }

    PollOutcome::TimedOut {
        attempts,
        elapsed: spent(clock),
    }
}
