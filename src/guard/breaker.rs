//! Per-endpoint circuit breakers.
//!
//! ```text
//! Closed   -> Open      failure_count >= failure_threshold (consecutive)
//! Open     -> HalfOpen  now - last_failure > recovery_timeout (one trial slot)
//! HalfOpen -> Closed    success_threshold consecutive trial successes
//! HalfOpen -> Open      any trial failure
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use super::GuardError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerState {
  Closed,
  Open,
  HalfOpen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerConfig {
  pub failure_threshold: u32,
  pub recovery_timeout: Duration,
  pub success_threshold: u32,
}

impl Default for BreakerConfig {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      recovery_timeout: Duration::from_secs(30),
      success_threshold: 3,
    }
  }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
  pub endpoint: String,
  pub state: BreakerState,
  pub failure_count: u32,
  pub success_count: u32,
  pub last_failure: Option<Instant>,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
  endpoint: String,
  config: BreakerConfig,
  state: BreakerState,
  failure_count: u32,
  success_count: u32,
  last_failure: Option<Instant>,
  trial_in_flight: bool,
}

impl CircuitBreaker {
  pub fn new(endpoint: impl Into<String>, config: BreakerConfig) -> Self {
    Self {
      endpoint: endpoint.into(),
      config,
      state: BreakerState::Closed,
      failure_count: 0,
      success_count: 0,
      last_failure: None,
      trial_in_flight: false,
    }
  }

  pub fn state(&self) -> BreakerState {
    self.state
  }

  /// Ask to attempt a call at `now`.
  pub fn try_acquire(&mut self, now: Instant) -> Result<(), GuardError> {
    match self.state {
      BreakerState::Closed => Ok(()),
      BreakerState::Open => {
        let elapsed = self
          .last_failure
          .map(|at| now.saturating_duration_since(at))
          .unwrap_or(Duration::MAX);

        if elapsed > self.config.recovery_timeout {
          self.transition(BreakerState::HalfOpen);
          self.success_count = 0;
          self.trial_in_flight = true;
          Ok(())
        } else {
          Err(GuardError::CircuitOpen {
            endpoint: self.endpoint.clone(),
            retry_after: self.config.recovery_timeout.saturating_sub(elapsed),
          })
        }
      }
      BreakerState::HalfOpen => {
        if self.trial_in_flight {
          Err(GuardError::TrialInProgress {
            endpoint: self.endpoint.clone(),
          })
        } else {
          self.trial_in_flight = true;
          Ok(())
        }
      }
    }
  }

  pub fn record_success(&mut self) {
    match self.state {
      BreakerState::Closed => self.failure_count = 0,
      BreakerState::HalfOpen => {
        self.trial_in_flight = false;
        self.success_count += 1;
        if self.success_count >= self.config.success_threshold {
          self.transition(BreakerState::Closed);
          self.failure_count = 0;
          self.success_count = 0;
        }
      }
      // A call admitted before the circuit opened
      BreakerState::Open => {}
    }
  }

  pub fn record_failure(&mut self, now: Instant) {
    self.last_failure = Some(now);
    match self.state {
      BreakerState::Closed => {
        self.failure_count += 1;
        if self.failure_count >= self.config.failure_threshold {
          self.transition(BreakerState::Open);
        }
      }
      BreakerState::HalfOpen => {
        self.trial_in_flight = false;
        self.success_count = 0;
        self.transition(BreakerState::Open);
      }
      BreakerState::Open => {}
    }
  }

  /// Free the trial slot of a call whose outcome was never recorded.
  fn abandon_trial(&mut self) {
    if self.state == BreakerState::HalfOpen {
      self.trial_in_flight = false;
    }
  }

  fn transition(&mut self, to: BreakerState) {
    if self.state == to {
      return;
    }
    match to {
      BreakerState::Open => warn!(
        endpoint = %self.endpoint,
        failures = self.failure_count,
        "circuit opened"
      ),
      _ => info!(endpoint = %self.endpoint, from = ?self.state, to = ?to, "circuit state changed"),
    }
    self.state = to;
  }

  pub fn snapshot(&self) -> CircuitBreakerState {
    CircuitBreakerState {
      endpoint: self.endpoint.clone(),
      state: self.state,
      failure_count: self.failure_count,
      success_count: self.success_count,
      last_failure: self.last_failure,
    }
  }
}

/// All breakers of one client, created lazily on first failure.
pub struct BreakerRegistry {
  config: BreakerConfig,
  breakers: Mutex<HashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
  pub fn new(config: BreakerConfig) -> Self {
    Self {
      config,
      breakers: Mutex::new(HashMap::new()),
    }
  }

  /// Permission to call `endpoint`. The permit must be settled with
  /// [`BreakerPermit::success`] or [`BreakerPermit::failure`]; dropping it
  /// unsettled frees a half-open trial slot without counting an outcome.
  pub fn acquire(&self, endpoint: &str) -> Result<BreakerPermit<'_>, GuardError> {
    if let Some(breaker) = self.breakers.lock().get_mut(endpoint) {
      breaker.try_acquire(Instant::now())?;
    }

    Ok(BreakerPermit {
      registry: self,
      endpoint: endpoint.to_string(),
      settled: false,
    })
  }

  pub fn record_success(&self, endpoint: &str) {
    if let Some(breaker) = self.breakers.lock().get_mut(endpoint) {
      breaker.record_success();
    }
  }

  pub fn record_failure(&self, endpoint: &str) {
    let mut breakers = self.breakers.lock();
    breakers
      .entry(endpoint.to_string())
      .or_insert_with(|| CircuitBreaker::new(endpoint, self.config))
      .record_failure(Instant::now());
  }

  fn abandon(&self, endpoint: &str) {
    if let Some(breaker) = self.breakers.lock().get_mut(endpoint) {
      breaker.abandon_trial();
    }
  }

  pub fn state(&self, endpoint: &str) -> BreakerState {
    self
      .breakers
      .lock()
      .get(endpoint)
      .map(CircuitBreaker::state)
      .unwrap_or(BreakerState::Closed)
  }

  pub fn snapshot(&self) -> Vec<CircuitBreakerState> {
    let mut states: Vec<CircuitBreakerState> = self
      .breakers
      .lock()
      .values()
      .map(CircuitBreaker::snapshot)
      .collect();
    states.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
    states
  }

  /// Forget an endpoint's breaker, closing it.
  pub fn reset(&self, endpoint: &str) -> bool {
    self.breakers.lock().remove(endpoint).is_some()
  }
}

impl Default for BreakerRegistry {
  fn default() -> Self {
    Self::new(BreakerConfig::default())
  }
}

pub struct BreakerPermit<'a> {
  registry: &'a BreakerRegistry,
  endpoint: String,
  settled: bool,
}

impl BreakerPermit<'_> {
  pub fn success(mut self) {
    self.settled = true;
    self.registry.record_success(&self.endpoint);
  }

  pub fn failure(mut self) {
    self.settled = true;
    self.registry.record_failure(&self.endpoint);
  }
}

impl Drop for BreakerPermit<'_> {
  fn drop(&mut self) {
    if !self.settled {
      self.registry.abandon(&self.endpoint);
    }
  }
}
