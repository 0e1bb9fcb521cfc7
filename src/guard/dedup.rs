//! Duplicate-request and burst suppression.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::GuardError;
use crate::http::FetchRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardConfig {
  /// Minimum spacing between two admitted calls with the same key
  pub min_interval: Duration,
  pub burst_window: Duration,
  /// More attempts than this inside `burst_window` blocks the key
  pub burst_limit: usize,
  pub block_duration: Duration,
  /// Sweep cadence; records idle longer than this are evicted
  pub cleanup_interval: Duration,
}

impl Default for GuardConfig {
  fn default() -> Self {
    Self {
      min_interval: Duration::from_secs(1),
      burst_window: Duration::from_secs(5),
      burst_limit: 5,
      block_duration: Duration::from_secs(60),
      cleanup_interval: Duration::from_secs(60),
    }
  }
}

/// Canonical identity of a request: method, URL and body.
///
/// JSON bodies are re-serialized so key order does not matter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey(String);

impl RequestKey {
  pub fn new(method: &str, url: &str, body: Option<&str>) -> Self {
    let body = body
      .map(|raw| match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value.to_string(),
        Err(_) => raw.to_string(),
      })
      .unwrap_or_default();

    let mut hasher = Sha256::new();
    hasher.update(method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_bytes());
    hasher.update(b"\n");
    hasher.update(body.as_bytes());
    Self(hex::encode(hasher.finalize()))
  }

  pub fn from_request(request: &FetchRequest) -> Self {
    Self::new(&request.method, &request.url, request.body.as_deref())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // Short form for logs
    f.write_str(&self.0[..12.min(self.0.len())])
  }
}

#[derive(Debug)]
struct PendingRequestRecord {
  /// Attempt times inside the burst window, oldest first
  attempts: VecDeque<Instant>,
  in_flight: bool,
  last_allowed: Option<Instant>,
  blocked_until: Option<Instant>,
  last_seen: Instant,
}

impl PendingRequestRecord {
  fn new(now: Instant) -> Self {
    Self {
      attempts: VecDeque::new(),
      in_flight: false,
      last_allowed: None,
      blocked_until: None,
      last_seen: now,
    }
  }

  fn is_blocked_at(&self, now: Instant) -> bool {
    self.blocked_until.is_some_and(|until| now < until)
  }
}

/// Tracks recent calls per [`RequestKey`] and refuses storms.
pub struct RequestGuard {
  config: GuardConfig,
  records: Mutex<HashMap<RequestKey, PendingRequestRecord>>,
}

impl RequestGuard {
  pub fn new(config: GuardConfig) -> Self {
    Self {
      config,
      records: Mutex::new(HashMap::new()),
    }
  }

  pub fn config(&self) -> &GuardConfig {
    &self.config
  }

  /// Admit a call or say why not. The ticket marks the key in flight until dropped.
  pub fn admit(&self, key: &RequestKey) -> Result<InFlightTicket<'_>, GuardError> {
    self.admit_at(key, Instant::now())
  }

  fn admit_at(&self, key: &RequestKey, now: Instant) -> Result<InFlightTicket<'_>, GuardError> {
    let mut records = self.records.lock();
    let record = records
      .entry(key.clone())
      .or_insert_with(|| PendingRequestRecord::new(now));
    record.last_seen = now;

    if let Some(until) = record.blocked_until {
      if now < until {
        return Err(GuardError::Blocked {
          request: key.to_string(),
          retry_after: until - now,
        });
      }
      record.blocked_until = None;
      record.attempts.clear();
    }

    record.attempts.push_back(now);
    while let Some(oldest) = record.attempts.front() {
      if now.duration_since(*oldest) > self.config.burst_window {
        record.attempts.pop_front();
      } else {
        break;
      }
    }

    if record.attempts.len() > self.config.burst_limit {
      record.blocked_until = Some(now + self.config.block_duration);
      warn!(
        request = %key,
        attempts = record.attempts.len(),
        window = ?self.config.burst_window,
        blocked_for = ?self.config.block_duration,
        "request abuse detected: burst limit exceeded, blocking key"
      );
      return Err(GuardError::Blocked {
        request: key.to_string(),
        retry_after: self.config.block_duration,
      });
    }

    if record.in_flight {
      return Err(GuardError::InFlight {
        request: key.to_string(),
      });
    }

    if let Some(last) = record.last_allowed {
      let since = now.duration_since(last);
      if since < self.config.min_interval {
        return Err(GuardError::TooSoon {
          request: key.to_string(),
          retry_after: self.config.min_interval - since,
        });
      }
    }

    record.in_flight = true;
    record.last_allowed = Some(now);

    Ok(InFlightTicket {
      guard: self,
      key: key.clone(),
    })
  }

  fn release(&self, key: &RequestKey) {
    if let Some(record) = self.records.lock().get_mut(key) {
      record.in_flight = false;
      record.last_seen = Instant::now();
    }
  }

  pub fn is_blocked(&self, key: &RequestKey) -> bool {
    let now = Instant::now();
    self
      .records
      .lock()
      .get(key)
      .is_some_and(|record| record.is_blocked_at(now))
  }

  /// Number of keys currently tracked.
  pub fn tracked(&self) -> usize {
    self.records.lock().len()
  }

  /// Evict idle records. Returns how many were removed.
  pub fn sweep(&self) -> usize {
    self.sweep_at(Instant::now())
  }

  fn sweep_at(&self, now: Instant) -> usize {
    let idle = self.config.cleanup_interval;
    let mut records = self.records.lock();
    let before = records.len();
    records.retain(|_, record| {
      record.in_flight
        || record.is_blocked_at(now)
        || now.saturating_duration_since(record.last_seen) <= idle
    });
    before - records.len()
  }

  /// Sweep every `cleanup_interval` until the guard is dropped.
  pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
    let weak: Weak<Self> = Arc::downgrade(self);
    let period = self.config.cleanup_interval;

    tokio::spawn(async move {
      let mut interval = tokio::time::interval(period);
      // first tick completes immediately
      interval.tick().await;
      loop {
        interval.tick().await;
        let Some(guard) = weak.upgrade() else {
          break;
        };
        let evicted = guard.sweep();
        if evicted > 0 {
          debug!(evicted, remaining = guard.tracked(), "swept idle request records");
        }
      }
    })
  }
}

impl Default for RequestGuard {
  fn default() -> Self {
    Self::new(GuardConfig::default())
  }
}

/// Holds a key in flight; dropping it (including on cancellation) releases the key.
pub struct InFlightTicket<'a> {
  guard: &'a RequestGuard,
  key: RequestKey,
}

impl Drop for InFlightTicket<'_> {
  fn drop(&mut self) {
    self.guard.release(&self.key);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key() -> RequestKey {
    RequestKey::new("GET", "http://a.test/api/tasks", None)
  }

  #[test]
  fn test_request_key_canonicalizes_json_bodies() {
    let a = RequestKey::new("post", "http://a.test/api/tasks", Some(r#"{"b":1,"a":2}"#));
    let b = RequestKey::new("POST", "http://a.test/api/tasks", Some(r#"{ "a": 2, "b": 1 }"#));
    let c = RequestKey::new("POST", "http://a.test/api/tasks", Some(r#"{"a":3,"b":1}"#));
    assert_eq!(a, b);
    assert_ne!(a, c);
  }

  #[test]
  fn test_second_call_within_min_interval_is_too_soon() {
    let guard = RequestGuard::default();
    let now = Instant::now();

    drop(guard.admit_at(&key(), now).unwrap());
    match guard.admit_at(&key(), now + Duration::from_millis(400)) {
      Err(GuardError::TooSoon { retry_after, .. }) => {
        assert_eq!(retry_after, Duration::from_millis(600))
      }
      other => panic!("expected too soon, got {:?}", other.err()),
    }

    assert!(guard.admit_at(&key(), now + Duration::from_millis(1100)).is_ok());
  }

  #[test]
  fn test_in_flight_duplicate_rejected() {
    let guard = RequestGuard::default();
    let now = Instant::now();

    let ticket = guard.admit_at(&key(), now).unwrap();
    assert!(matches!(
      guard.admit_at(&key(), now + Duration::from_secs(2)),
      Err(GuardError::InFlight { .. })
    ));
    drop(ticket);
    assert!(guard.admit_at(&key(), now + Duration::from_secs(3)).is_ok());
  }

  #[test]
  fn test_burst_blocks_key_for_block_duration() {
    let guard = RequestGuard::default();
    let start = Instant::now();

    for n in 0..5u64 {
      let result = guard.admit_at(&key(), start + Duration::from_millis(n * 100));
      assert!(!matches!(result, Err(GuardError::Blocked { .. })));
    }

    let sixth = guard.admit_at(&key(), start + Duration::from_millis(500));
    assert!(matches!(sixth, Err(GuardError::Blocked { .. })));

    let seventh = guard.admit_at(&key(), start + Duration::from_secs(30));
    match seventh {
      Err(GuardError::Blocked { retry_after, .. }) => {
        assert_eq!(retry_after, Duration::from_millis(30_500))
      }
      other => panic!("expected blocked, got {:?}", other.err()),
    }

    assert!(guard
      .admit_at(&key(), start + Duration::from_millis(60_600))
      .is_ok());
  }

  #[test]
  fn test_other_keys_unaffected_by_block() {
    let guard = RequestGuard::default();
    let start = Instant::now();
    for n in 0..6u64 {
      let _ = guard.admit_at(&key(), start + Duration::from_millis(n * 10));
    }

    let other = RequestKey::new("GET", "http://a.test/api/projects", None);
    assert!(guard.admit_at(&other, start + Duration::from_millis(70)).is_ok());
  }

  #[test]
  fn test_sweep_evicts_idle_records_only() {
    let guard = RequestGuard::default();
    let start = Instant::now();

    drop(guard.admit_at(&key(), start).unwrap());
    let busy = RequestKey::new("GET", "http://a.test/api/slow", None);
    let _ticket = guard.admit_at(&busy, start).unwrap();

    assert_eq!(guard.sweep_at(start + Duration::from_secs(30)), 0);
    // the dropped ticket stamped last_seen with the real clock, so sweep well past it
    assert_eq!(guard.sweep_at(Instant::now() + Duration::from_secs(61)), 1);
    assert_eq!(guard.tracked(), 1);
  }
}
