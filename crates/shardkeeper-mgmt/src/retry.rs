//! Bounded fixed-interval retries.
//!
//! Step-down re-election, post-upgrade verification and password rotation all
//! poll the cluster a fixed number of times with a fixed wait in between. The
//! wait goes through a [`Sleeper`] so tests run without real delays.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::Result;

/// Suspends the caller between attempts.
#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Sleeps on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Returns immediately and remembers every requested wait.
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    waits: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn waits(&self) -> Vec<Duration> {
        self.waits.lock().map(|w| w.clone()).unwrap_or_default()
    }

    pub fn count(&self) -> usize {
        self.waits().len()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut waits) = self.waits.lock() {
            waits.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Configuration for a bounded retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Fixed wait between two attempts.
    pub wait: Duration,
}

impl RetryConfig {
    pub fn new(max_attempts: u32, wait: Duration) -> Self {
        Self { max_attempts, wait }
    }

    /// Window the loop may block its caller for, ignoring time spent in attempts.
    pub fn window(&self) -> Duration {
        self.wait * self.max_attempts.saturating_sub(1)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            wait: Duration::from_secs(1),
        }
    }
}

/// Runs an operation until it succeeds or attempts run out.
pub struct RetryExecutor<'a> {
    config: RetryConfig,
    sleeper: &'a dyn Sleeper,
}

impl<'a> RetryExecutor<'a> {
    pub fn new(config: RetryConfig, sleeper: &'a dyn Sleeper) -> Self {
        Self { config, sleeper }
    }

    /// Every error is retried; after the last attempt its error is returned unchanged.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt >= attempts => {
                    tracing::debug!("Giving up after {} attempts: {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!("Attempt {}/{} failed: {}", attempt, attempts, e);
                    self.sleeper.sleep(self.config.wait).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoordError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_retry_config_window() {
        let config = RetryConfig::new(30, Duration::from_secs(1));
        assert_eq!(config.window(), Duration::from_secs(29));
        assert_eq!(RetryConfig::default().max_attempts, 20);
    }

    #[tokio::test]
    async fn test_execute_succeeds_first_attempt() {
        let sleeper = RecordingSleeper::new();
        let executor = RetryExecutor::new(RetryConfig::default(), &sleeper);
        let value = executor.execute(|_| async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
        assert_eq!(sleeper.count(), 0);
    }

    #[tokio::test]
    async fn test_execute_retries_until_success() {
        let sleeper = RecordingSleeper::new();
        let executor = RetryExecutor::new(RetryConfig::new(5, Duration::from_secs(1)), &sleeper);
        let calls = AtomicU32::new(0);
        let value = executor
            .execute(|attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(CoordError::NotReady("syncing".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(sleeper.waits(), vec![Duration::from_secs(1); 2]);
    }

    #[tokio::test]
    async fn test_execute_returns_last_error() {
        let sleeper = RecordingSleeper::new();
        let executor = RetryExecutor::new(RetryConfig::new(4, Duration::from_millis(10)), &sleeper);
        let result: Result<()> = executor
            .execute(|attempt| async move { Err(CoordError::NotReady(format!("attempt {}", attempt))) })
            .await;
        match result {
            Err(CoordError::NotReady(msg)) => assert_eq!(msg, "attempt 4"),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(sleeper.count(), 3);
    }
}
