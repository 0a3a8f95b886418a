//! Circuit breaker protecting the IMAP client adapter from cascading failures.
//!
//! Tracks consecutive transient failures per account and temporarily
//! rejects further attempts once a threshold is reached, then probes
//! recovery after a cooldown.
//!
//! # Circuit States
//!
//! - **Closed**: normal operation, requests pass through.
//! - **Open**: threshold exceeded, requests are rejected immediately.
//! - **HalfOpen**: testing recovery, allows one request through.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::CircuitBreakerConfig;
use crate::error::{MailRulezError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    config: CircuitBreakerConfig,
}

impl CircuitBreakerState {
    fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            config,
        }
    }

    fn should_allow_request(&mut self) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        match self.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                if let Some(opened_at) = self.opened_at {
                    let elapsed = opened_at.elapsed();
                    let timeout = Duration::from_secs(self.config.reset_timeout_secs);

                    if elapsed >= timeout {
                        debug!(?elapsed, "circuit breaker transitioning to half-open");
                        self.state = CircuitState::HalfOpen;
                        self.success_count = 0;
                        Ok(())
                    } else {
                        Err(MailRulezError::Unknown(format!(
                            "circuit breaker open after {} consecutive failures, retry in {}s",
                            self.failure_count,
                            (timeout - elapsed).as_secs()
                        )))
                    }
                } else {
                    warn!("circuit breaker open with no opened_at timestamp, resetting");
                    self.state = CircuitState::Closed;
                    Ok(())
                }
            }
            CircuitState::HalfOpen => Ok(()),
        }
    }

    fn record_success(&mut self) {
        if !self.config.enabled {
            return;
        }

        match self.state {
            CircuitState::Closed => {
                if self.failure_count > 0 {
                    self.failure_count = 0;
                }
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                debug!("circuit breaker: success, closing circuit");
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.success_count = 0;
                self.opened_at = None;
            }
        }
    }

    fn record_failure(&mut self, error: &MailRulezError) {
        if !self.config.enabled || !error.is_transient() {
            return;
        }

        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    warn!(
                        failures = self.failure_count,
                        "circuit breaker: threshold reached, opening circuit"
                    );
                    self.state = CircuitState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                warn!("circuit breaker: failure in half-open, reopening");
                self.state = CircuitState::Open;
                self.opened_at = Some(Instant::now());
                self.success_count = 0;
            }
            CircuitState::Open => {
                debug!("circuit breaker: failure recorded while already open");
            }
        }
    }

    fn get_state(&self) -> CircuitState {
        self.state
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    state: Arc<Mutex<CircuitBreakerState>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(CircuitBreakerState::new(config))),
        }
    }

    pub async fn check_request(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.should_allow_request()
    }

    pub async fn record_success(&self) {
        let mut state = self.state.lock().await;
        state.record_success();
    }

    pub async fn record_failure(&self, error: &MailRulezError) {
        let mut state = self.state.lock().await;
        state.record_failure(error);
    }

    pub async fn state(&self) -> CircuitState {
        let state = self.state.lock().await;
        state.get_state()
    }

    /// Execute a closure with circuit breaker protection: checks admission,
    /// runs the operation, records the outcome.
    pub async fn call<F, T>(&self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<T>> + Send>>,
    {
        self.check_request().await?;

        match operation().await {
            Ok(result) => {
                self.record_success().await;
                Ok(result)
            }
            Err(error) => {
                self.record_failure(&error).await;
                Err(error)
            }
        }
    }

    pub async fn reset(&self) {
        let mut state = self.state.lock().await;
        state.state = CircuitState::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.opened_at = None;
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.lock().await;
        CircuitBreakerStats {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            opened_at: state.opened_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<Instant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(threshold: u32, reset_secs: u64) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            enabled: true,
            failure_threshold: threshold,
            reset_timeout_secs: reset_secs,
        }
    }

    fn transient() -> MailRulezError {
        MailRulezError::connection("a@b.com", "reset by peer")
    }

    fn permanent() -> MailRulezError {
        MailRulezError::PolicyValidation {
            message: "bad policy".into(),
        }
    }

    #[tokio::test]
    async fn closed_state_allows_requests() {
        let breaker = CircuitBreaker::new(config(3, 1));
        assert!(breaker.check_request().await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_transient_failures() {
        let breaker = CircuitBreaker::new(config(3, 1));
        for _ in 0..3 {
            breaker.record_failure(&transient()).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        assert!(breaker.check_request().await.is_err());
    }

    #[tokio::test]
    async fn permanent_errors_never_open_circuit() {
        let breaker = CircuitBreaker::new(config(1, 1));
        for _ in 0..10 {
            breaker.record_failure(&permanent()).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let breaker = CircuitBreaker::new(config(3, 1));
        breaker.record_failure(&transient()).await;
        breaker.record_failure(&transient()).await;
        assert_eq!(breaker.stats().await.failure_count, 2);
        breaker.record_success().await;
        assert_eq!(breaker.stats().await.failure_count, 0);
    }

    #[tokio::test]
    async fn transitions_to_half_open_after_cooldown() {
        let breaker = CircuitBreaker::new(config(2, 1));
        breaker.record_failure(&transient()).await;
        breaker.record_failure(&transient()).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(breaker.check_request().await.is_ok());
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new(config(2, 1));
        breaker.record_failure(&transient()).await;
        breaker.record_failure(&transient()).await;
        tokio::time::sleep(Duration::from_secs(2)).await;
        breaker.check_request().await.ok();
        breaker.record_failure(&transient()).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn disabled_breaker_never_blocks() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            enabled: false,
            failure_threshold: 1,
            reset_timeout_secs: 60,
        });
        for _ in 0..10 {
            breaker.record_failure(&transient()).await;
        }
        assert!(breaker.check_request().await.is_ok());
    }

    #[tokio::test]
    async fn manual_reset_closes_circuit() {
        let breaker = CircuitBreaker::new(config(1, 60));
        breaker.record_failure(&transient()).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
        breaker.reset().await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert!(breaker.check_request().await.is_ok());
    }
}
