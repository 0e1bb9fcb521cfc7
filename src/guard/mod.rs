//! Client-side request resilience: duplicate/burst suppression plus per-endpoint
//! circuit breakers in front of the transport.
//!
//! The dedup guard decides whether an attempt is made at all; the breaker
//! decides whether an attempted call reaches the transport and records how it
//! went. Both registries are owned by the [`ResilientClient`] they are injected
//! into, so separate clients (tabs, tenants, tests) never share state.

mod breaker;
mod dedup;

use color_eyre::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::http::{FetchRequest, FetchResponse};
use crate::network::Network;

pub use breaker::{
  BreakerConfig, BreakerPermit, BreakerRegistry, BreakerState, CircuitBreaker, CircuitBreakerState,
};
pub use dedup::{GuardConfig, InFlightTicket, RequestGuard, RequestKey};

/// Why a call was refused before reaching the network.
///
/// Returned inside the `eyre::Report`; use `report.downcast_ref::<GuardError>()`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
  #[error("circuit open for {endpoint}; retry in {retry_after:?}")]
  CircuitOpen {
    endpoint: String,
    retry_after: Duration,
  },

  #[error("circuit for {endpoint} is half-open and already probing")]
  TrialInProgress { endpoint: String },

  #[error("identical request {request} is already in flight")]
  InFlight { request: String },

  #[error("request {request} repeated too soon; retry in {retry_after:?}")]
  TooSoon {
    request: String,
    retry_after: Duration,
  },

  #[error("request {request} blocked after a burst; retry in {retry_after:?}")]
  Blocked {
    request: String,
    retry_after: Duration,
  },
}

impl GuardError {
  /// How long to wait before the same call could be admitted, when known.
  pub fn retry_after(&self) -> Option<Duration> {
    match self {
      GuardError::CircuitOpen { retry_after, .. }
      | GuardError::TooSoon { retry_after, .. }
      | GuardError::Blocked { retry_after, .. } => Some(*retry_after),
      GuardError::TrialInProgress { .. } | GuardError::InFlight { .. } => None,
    }
  }
}

/// Breaker key for a request: method plus host and path, ignoring the query.
pub fn endpoint_key(request: &FetchRequest) -> String {
  match url::Url::parse(&request.url) {
    Ok(url) => format!(
      "{} {}{}",
      request.method,
      url.host_str().unwrap_or_default(),
      url.path()
    ),
    Err(_) => format!("{} {}", request.method, request.path()),
  }
}

/// Outbound client wrapping a transport with the guard and breakers.
#[derive(Clone)]
pub struct ResilientClient {
  transport: Arc<dyn Network>,
  guard: Arc<RequestGuard>,
  breakers: Arc<BreakerRegistry>,
}

impl ResilientClient {
  pub fn new(
    transport: Arc<dyn Network>,
    guard: Arc<RequestGuard>,
    breakers: Arc<BreakerRegistry>,
  ) -> Self {
    Self {
      transport,
      guard,
      breakers,
    }
  }

  pub fn guard(&self) -> &Arc<RequestGuard> {
    &self.guard
  }

  pub fn breakers(&self) -> &Arc<BreakerRegistry> {
    &self.breakers
  }

  /// Send a request through the guard and the endpoint's breaker.
  ///
  /// Transport errors and 5xx responses count as breaker failures. A queued
  /// acceptance or a cached fallback never reached the origin, so neither is
  /// recorded and both are returned as-is.
  pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    let key = RequestKey::from_request(request);
    let endpoint = endpoint_key(request);

    let _ticket = self.guard.admit(&key)?;
    let permit = self.breakers.acquire(&endpoint)?;

    match self.transport.fetch(request).await {
      Ok(response) if response.queued_request_id().is_some() => {
        debug!(endpoint = %endpoint, "request queued; breaker outcome not recorded");
        drop(permit);
        Ok(response)
      }
      Ok(response) if response.is_from_cache() => {
        debug!(endpoint = %endpoint, "served from cache; breaker outcome not recorded");
        drop(permit);
        Ok(response)
      }
      Ok(response) if response.is_server_error() => {
        permit.failure();
        Ok(response)
      }
      Ok(response) => {
        permit.success();
        Ok(response)
      }
      Err(e) => {
        permit.failure();
        Err(e)
      }
    }
  }

  /// Run an arbitrary async operation under the guard and a breaker.
  pub async fn call<T, F, Fut>(&self, key: &RequestKey, endpoint: &str, operation: F) -> Result<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let _ticket = self.guard.admit(key)?;
    let permit = self.breakers.acquire(endpoint)?;

    match operation().await {
      Ok(value) => {
        permit.success();
        Ok(value)
      }
      Err(e) => {
        permit.failure();
        Err(e)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::FakeNetwork;

  fn client(network: Arc<FakeNetwork>) -> ResilientClient {
    ResilientClient::new(
      network,
      Arc::new(RequestGuard::default()),
      Arc::new(BreakerRegistry::default()),
    )
  }

  fn page(n: u32) -> FetchRequest {
    FetchRequest::get(format!("http://a.test/api/tasks?page={}", n))
  }

  fn guard_error(report: &color_eyre::Report) -> &GuardError {
    report
      .downcast_ref::<GuardError>()
      .expect("expected a guard rejection")
  }

  #[test]
  fn test_endpoint_key_ignores_query() {
    assert_eq!(endpoint_key(&page(1)), "GET a.test/api/tasks");
    assert_eq!(endpoint_key(&page(1)), endpoint_key(&page(2)));
  }

  #[tokio::test(start_paused = true)]
  async fn test_open_circuit_rejects_without_network() {
    let network = Arc::new(FakeNetwork::new());
    network.set_online(false);
    let client = client(network.clone());

    for n in 0..5 {
      assert!(client.fetch(&page(n)).await.is_err());
    }
    assert_eq!(network.requests().len(), 5);

    let err = client.fetch(&page(5)).await.unwrap_err();
    assert!(matches!(guard_error(&err), GuardError::CircuitOpen { .. }));
    assert_eq!(network.requests().len(), 5);

    tokio::time::advance(Duration::from_secs(31)).await;
    network.set_online(true);
    network.respond_to_all(FetchResponse::new(200, "[]"));

    for n in 6..9 {
      client.fetch(&page(n)).await.unwrap();
    }
    assert_eq!(
      client.breakers().state("GET a.test/api/tasks"),
      BreakerState::Closed
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_server_errors_count_as_failures() {
    let network = Arc::new(FakeNetwork::new());
    network.respond_to_all(FetchResponse::new(503, ""));
    let client = client(network.clone());

    for n in 0..5 {
      let response = client.fetch(&page(n)).await.unwrap();
      assert_eq!(response.status, 503);
    }
    assert_eq!(
      client.breakers().state("GET a.test/api/tasks"),
      BreakerState::Open
    );
  }

  #[tokio::test(start_paused = true)]
  async fn test_duplicate_call_too_soon() {
    let network = Arc::new(FakeNetwork::new());
    network.respond_to_all(FetchResponse::new(200, "[]"));
    let client = client(network.clone());

    client.fetch(&page(1)).await.unwrap();
    let err = client.fetch(&page(1)).await.unwrap_err();
    let rejection = guard_error(&err);
    assert!(matches!(rejection, GuardError::TooSoon { .. }));
    assert!(rejection.retry_after().is_some());
    assert_eq!(network.requests().len(), 1);

    tokio::time::advance(Duration::from_millis(1001)).await;
    client.fetch(&page(1)).await.unwrap();
  }

  #[tokio::test(start_paused = true)]
  async fn test_queued_response_does_not_touch_breaker() {
    let network = Arc::new(FakeNetwork::new());
    network.respond_to_all(crate::cache::queued_response("q-1"));
    let client = client(network);

    let request = FetchRequest::new("POST", "http://a.test/api/tasks").with_body("{}");
    let response = client.fetch(&request).await.unwrap();
    assert_eq!(response.queued_request_id(), Some("q-1"));
    assert!(client.breakers().snapshot().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_cache_fallbacks_do_not_reset_failures() {
    let network = Arc::new(FakeNetwork::new());
    let offline = crate::cache::offline_payload();
    let cached = FetchResponse::new(200, "[]").with_header(crate::http::SERVED_FROM_HEADER, "cache");
    for n in 0..10 {
      let response = if n % 2 == 0 { cached.clone() } else { offline.clone() };
      network.respond("GET", &page(n).url, response);
    }
    let client = client(network.clone());

    for n in 0..10 {
      let _ = client.fetch(&page(n)).await;
    }
    assert_eq!(
      client.breakers().state("GET a.test/api/tasks"),
      BreakerState::Open
    );

    let err = client.fetch(&page(10)).await.unwrap_err();
    assert!(matches!(guard_error(&err), GuardError::CircuitOpen { .. }));
    assert_eq!(network.requests().len(), 10);
  }

  #[tokio::test(start_paused = true)]
  async fn test_call_wraps_arbitrary_operations() {
    let client = client(Arc::new(FakeNetwork::new()));
    let key = RequestKey::new("RPC", "export", None);

    let value = client
      .call(&key, "export", || async { Ok::<_, color_eyre::Report>(42) })
      .await
      .unwrap();
    assert_eq!(value, 42);

    let err = client
      .call(&key, "export", || async { Ok::<_, color_eyre::Report>(0) })
      .await
      .unwrap_err();
    assert!(matches!(guard_error(&err), GuardError::TooSoon { .. }));
  }
}
