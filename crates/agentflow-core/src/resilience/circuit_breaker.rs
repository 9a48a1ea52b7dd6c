//! Circuit breaker for external dependencies.
//!
//! Counts consecutive failures of calls to one dependency (storage, cache).
//! At the threshold the breaker opens and calls fail fast without running.
//! Once the cooldown has elapsed the next call finds the breaker closed again
//! with a clean failure count.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agentflow_types::config::CircuitBreakerConfig;
use serde::Serialize;
use tokio::time::Instant;

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    /// Calls pass through. Tracks consecutive failures toward the threshold.
    Closed { consecutive_failures: u32 },
    /// Calls are rejected until `cooldown` has elapsed since `opened_at`.
    Open {
        opened_at: Instant,
        cooldown: Duration,
    },
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    total_calls: u64,
    total_failures: u64,
    last_error: Option<String>,
}

/// Public view of a breaker's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerStateKind {
    Closed,
    Open,
}

/// Status report for one breaker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerStateKind,
    /// Consecutive failures while closed; the threshold while open.
    pub failures: u32,
    pub threshold: u32,
    pub total_calls: u64,
    pub total_failures: u64,
    pub last_error: Option<String>,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker '{name}' is open")]
    Open { name: String },

    #[error("{0}")]
    Inner(E),
}

/// Consecutive-failure circuit breaker for one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// `threshold` is clamped to at least 1.
    pub fn new(name: impl Into<String>, threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            threshold: threshold.max(1),
            cooldown,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed {
                    consecutive_failures: 0,
                },
                total_calls: 0,
                total_failures: 0,
                last_error: None,
            }),
        }
    }

    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            name,
            config.failure_threshold,
            Duration::from_secs(config.cooldown_secs),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether a call would run now. Resets an open breaker whose cooldown
    /// has elapsed.
    pub fn is_available(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed { .. } => true,
            BreakerState::Open {
                opened_at,
                cooldown,
            } => {
                if opened_at.elapsed() >= cooldown {
                    inner.state = BreakerState::Closed {
                        consecutive_failures: 0,
                    };
                    tracing::info!(breaker = %self.name, "circuit breaker closed after cooldown");
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.state = BreakerState::Closed {
            consecutive_failures: 0,
        };
    }

    pub fn record_failure(&self, error: &str) {
        let mut inner = self.lock();
        inner.total_calls += 1;
        inner.total_failures += 1;
        inner.last_error = Some(error.to_string());

        if let BreakerState::Closed {
            consecutive_failures,
        } = inner.state
        {
            let failures = consecutive_failures + 1;
            if failures >= self.threshold {
                inner.state = BreakerState::Open {
                    opened_at: Instant::now(),
                    cooldown: self.cooldown,
                };
                tracing::warn!(
                    breaker = %self.name,
                    failures,
                    cooldown_secs = self.cooldown.as_secs(),
                    error,
                    "circuit breaker opened"
                );
            } else {
                inner.state = BreakerState::Closed {
                    consecutive_failures: failures,
                };
            }
        }
    }

    /// Run `operation` through the breaker; every error counts as a failure.
    pub async fn call<T, E, F>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.call_classified(operation, |_| true).await
    }

    /// Like [`call`](Self::call), but only errors for which `trips` returns
    /// `true` count toward the threshold. Other errors leave the state as is.
    pub async fn call_classified<T, E, F, P>(
        &self,
        operation: F,
        trips: P,
    ) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        if !self.is_available() {
            return Err(BreakerError::Open {
                name: self.name.clone(),
            });
        }

        match operation.await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if trips(&e) {
                    self.record_failure(&e.to_string());
                } else {
                    self.lock().total_calls += 1;
                }
                Err(BreakerError::Inner(e))
            }
        }
    }

    pub fn status(&self) -> BreakerStatus {
        let inner = self.lock();
        let (state, failures) = match inner.state {
            BreakerState::Closed {
                consecutive_failures,
            } => (BreakerStateKind::Closed, consecutive_failures),
            BreakerState::Open { .. } => (BreakerStateKind::Open, self.threshold),
        };
        BreakerStatus {
            name: self.name.clone(),
            state,
            failures,
            threshold: self.threshold,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            last_error: inner.last_error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn fail(breaker: &CircuitBreaker) -> Result<(), BreakerError<String>> {
        breaker.call(async { Err::<(), _>("boom".to_string()) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<u32, BreakerError<String>> {
        breaker.call(async { Ok::<_, String>(7) }).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_exactly_threshold_failures() {
        let breaker = CircuitBreaker::new("storage", 3, Duration::from_secs(60));

        for _ in 0..2 {
            assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        }
        assert_eq!(breaker.status().state, BreakerStateKind::Closed);
        assert_eq!(breaker.status().failures, 2);

        assert!(matches!(fail(&breaker).await, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.status().state, BreakerStateKind::Open);

        // Open: the operation is not run.
        let ran = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .call(async {
                ran.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok::<_, String>(())
            })
            .await;
        assert!(matches!(result, Err(BreakerError::Open { ref name }) if name == "storage"));
        assert!(!ran.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stays_open_until_cooldown_then_closes() {
        let breaker = CircuitBreaker::new("cache", 1, Duration::from_secs(60));
        fail(&breaker).await.unwrap_err();

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(matches!(succeed(&breaker).await, Err(BreakerError::Open { .. })));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(succeed(&breaker).await.unwrap(), 7);
        let status = breaker.status();
        assert_eq!(status.state, BreakerStateKind::Closed);
        assert_eq!(status.failures, 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_failures() {
        let breaker = CircuitBreaker::new("storage", 3, Duration::from_secs(60));
        fail(&breaker).await.unwrap_err();
        fail(&breaker).await.unwrap_err();
        succeed(&breaker).await.unwrap();
        fail(&breaker).await.unwrap_err();

        let status = breaker.status();
        assert_eq!(status.state, BreakerStateKind::Closed);
        assert_eq!(status.failures, 1);
        assert_eq!(status.total_calls, 4);
        assert_eq!(status.total_failures, 3);
        assert_eq!(status.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn test_classified_errors_do_not_trip() {
        let breaker = CircuitBreaker::new("storage", 1, Duration::from_secs(60));
        let result = breaker
            .call_classified(async { Err::<(), _>("not found".to_string()) }, |_| false)
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
        assert_eq!(breaker.status().state, BreakerStateKind::Closed);
    }

    #[test]
    fn test_threshold_clamped_and_from_config() {
        let breaker = CircuitBreaker::new("x", 0, Duration::ZERO);
        assert_eq!(breaker.status().threshold, 1);

        let breaker = CircuitBreaker::from_config("storage", &CircuitBreakerConfig::default());
        assert_eq!(breaker.status().threshold, 5);
        assert_eq!(breaker.name(), "storage");
    }
}
