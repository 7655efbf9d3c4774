//! Retry with backoff for transient failures

use crate::error::{RegistryError, Result};
use crate::logging::Logger;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// base, 2*base, 4*base, ...
    Exponential { base: Duration },
    /// step, 2*step, 3*step, ...
    Linear { step: Duration },
}

impl Backoff {
    /// Delay after the `failed_attempt`-th failure (1-based)
    pub fn delay(&self, failed_attempt: u32) -> Duration {
        let n = failed_attempt.max(1);
        match self {
            Backoff::Exponential { base } => base.saturating_mul(1u32 << (n - 1).min(16)),
            Backoff::Linear { step } => step.saturating_mul(n),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
    retryable: fn(&RegistryError) -> bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff,
            retryable: RegistryError::is_transient,
        }
    }

    /// Registry requests: 3 attempts, 1s then 2s, transient errors only
    pub fn transport() -> Self {
        Self::new(3, Backoff::Exponential { base: Duration::from_secs(1) })
    }

    /// Establishing a proxy tunnel: 3 attempts, 1s then 2s, any failure but bad configuration
    pub fn proxy_dial() -> Self {
        Self::new(3, Backoff::Linear { step: Duration::from_secs(1) })
            .with_predicate(|err| !matches!(err, RegistryError::Config(_)))
    }

    pub fn single_attempt() -> Self {
        Self::new(1, Backoff::Linear { step: Duration::ZERO })
    }

    pub fn with_predicate(mut self, retryable: fn(&RegistryError) -> bool) -> Self {
        self.retryable = retryable;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn backoff(&self) -> Backoff {
        self.backoff
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    /// The closure receives the 1-based attempt number.
    pub async fn run<T, F, Fut>(&self, output: &Logger, description: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && (self.retryable)(&err) => {
                    let delay = self.backoff.delay(attempt);
                    output.warning(&format!(
                        "{} failed (attempt {}/{}): {}; retrying in {}",
                        description,
                        attempt,
                        self.max_attempts,
                        err,
                        output.format_duration(delay)
                    ));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
