// Bounded retry with pluggable backoff

use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::debug;

/// Delay to wait after the `attempt`-th failure (1-based)
pub trait Backoff: Send + Sync + fmt::Debug {
    fn delay(&self, attempt: u32) -> Duration;
}

#[derive(Debug, Clone, Copy)]
pub struct FixedBackoff(pub Duration);

impl Backoff for FixedBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinearBackoff {
    pub step: Duration,
}

impl Backoff for LinearBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt.max(1))
    }
}

/// Exponential backoff with optional proportional jitter
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let mut millis = (self.base.as_millis() as f64 * exp).min(self.max.as_millis() as f64);
        if self.jitter > 0.0 {
            let spread = millis * self.jitter;
            millis += rand::thread_rng().gen_range(-spread..=spread);
        }
        Duration::from_millis(millis.max(0.0) as u64)
    }
}

/// What one attempt decided
#[derive(Debug)]
pub enum Attempt<T, E> {
    Done(T),
    Retry(E),
    /// Retry, but not sooner than the given delay
    RetryAfter(E, Duration),
    Abort(E),
}

#[derive(Debug, Error)]
pub enum RetryError<E> {
    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },

    #[error("aborted on attempt {attempt}: {error}")]
    Aborted { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Aborted { attempt, .. } => *attempt,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

/// Runs an operation at most `max_attempts` times
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Arc<dyn Backoff>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: impl Backoff + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Arc::new(backoff),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it finishes, aborts, or the attempt budget is spent.
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, E, F, Fut>(&self, mut operation: F) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Attempt<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let wait = match operation(attempt).await {
                Attempt::Done(value) => return Ok(value),
                Attempt::Abort(error) => return Err(RetryError::Aborted { attempt, error }),
                Attempt::Retry(last) | Attempt::RetryAfter(last, _) if attempt >= self.max_attempts => {
                    return Err(RetryError::Exhausted { attempts: attempt, last });
                }
                Attempt::Retry(_) => self.backoff.delay(attempt),
                Attempt::RetryAfter(_, hint) => self.backoff.delay(attempt).max(hint),
            };
            debug!("🔁 Attempt {} failed, retrying in {:?}", attempt, wait);
            if !wait.is_zero() {
                sleep(wait).await;
            }
        }
    }
}
