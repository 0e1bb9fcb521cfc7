//! Durable, ordered store of mutations issued while offline.
//!
//! Entries are written to SQLite as soon as a mutating request fails offline and
//! stay there until a replay gets a 2xx back for them. They never expire, and
//! clearing the response caches does not touch them.

mod lease;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::db;
use crate::http::{FetchRequest, FetchResponse};
use crate::network::Network;

const LAST_SYNC_KEY: &str = "last_sync";

pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);

/// Schema for the queue tables.
const QUEUE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offline_queue (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_queue_enqueued_at ON offline_queue(enqueued_at);
"#;

/// A mutating request waiting for connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMutation {
  pub id: String,
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  pub enqueued_at: DateTime<Utc>,
}

impl QueuedMutation {
  /// The request to re-issue on replay.
  pub fn to_request(&self) -> FetchRequest {
    FetchRequest {
      method: self.method.clone(),
      url: self.url.clone(),
      headers: self.headers.clone(),
      body: self.body.clone(),
      navigation: false,
    }
  }
}

/// Result of replaying one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayOutcome {
  pub id: String,
  pub success: bool,
  /// None when the network never answered
  pub status: Option<u16>,
}

/// Summary of one replay pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
  pub replayed: usize,
  pub failed: usize,
  pub remaining: usize,
  /// Another replay (here or in another context) was already draining
  pub skipped: bool,
}

/// Handle on the queue database for one context.
///
/// Clones share the same connection, lease identity and replay lock. Separate
/// handles opened on the same file (other tabs/processes) compete for the
/// replay lease.
#[derive(Clone)]
pub struct OfflineQueue {
  conn: Arc<Mutex<Connection>>,
  owner: String,
  lease_ttl: Duration,
  replaying: Arc<tokio::sync::Mutex<()>>,
}

impl OfflineQueue {
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, &schema())?;
    Ok(Self::from_connection(conn))
  }

  pub fn in_memory() -> Result<Self> {
    let conn = db::open_in_memory(&schema())?;
    Ok(Self::from_connection(conn))
  }

  fn from_connection(conn: Connection) -> Self {
    Self {
      conn: Arc::new(Mutex::new(conn)),
      owner: uuid::Uuid::new_v4().to_string(),
      lease_ttl: DEFAULT_LEASE_TTL,
      replaying: Arc::new(tokio::sync::Mutex::new(())),
    }
  }

  pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
    self.lease_ttl = lease_ttl;
    self
  }

  /// Persist a snapshot of `request`. Never waits on the network.
  pub fn enqueue(&self, request: &FetchRequest) -> Result<QueuedMutation> {
    let mutation = QueuedMutation {
      id: uuid::Uuid::new_v4().to_string(),
      url: request.url.clone(),
      method: request.method.clone(),
      headers: request.headers.clone(),
      body: request.body.clone(),
      enqueued_at: Utc::now(),
    };

    let headers = serde_json::to_string(&mutation.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let conn = db::lock(&self.conn)?;
    conn
      .execute(
        "INSERT INTO offline_queue (id, url, method, headers, body, enqueued_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
          mutation.id,
          mutation.url,
          mutation.method,
          headers,
          mutation.body,
          db::to_millis(mutation.enqueued_at)
        ],
      )
      .map_err(|e| eyre!("Failed to enqueue {} {}: {}", mutation.method, mutation.url, e))?;

    info!(id = %mutation.id, method = %mutation.method, url = %mutation.url, "queued offline mutation");
    Ok(mutation)
  }

  /// All entries in enqueue order.
  pub fn entries(&self) -> Result<Vec<QueuedMutation>> {
    let conn = db::lock(&self.conn)?;
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, enqueued_at FROM offline_queue
         ORDER BY enqueued_at, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, String>(2)?,
          row.get::<_, String>(3)?,
          row.get::<_, Option<String>>(4)?,
          row.get::<_, i64>(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query offline queue: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read offline queue: {}", e))?;

    rows
      .into_iter()
      .map(|(id, url, method, headers, body, enqueued_at)| {
        Ok(QueuedMutation {
          headers: serde_json::from_str(&headers)
            .map_err(|e| eyre!("Failed to deserialize headers of {}: {}", id, e))?,
          enqueued_at: db::from_millis(enqueued_at)?,
          id,
          url,
          method,
          body,
        })
      })
      .collect()
  }

  pub fn len(&self) -> Result<usize> {
    let conn = db::lock(&self.conn)?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM offline_queue", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count offline queue: {}", e))?;
    Ok(count as usize)
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }

  /// Delete an entry. Returns false if it was already gone.
  pub fn remove(&self, id: &str) -> Result<bool> {
    let conn = db::lock(&self.conn)?;
    let removed = conn
      .execute("DELETE FROM offline_queue WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove queued mutation {}: {}", id, e))?;
    Ok(removed > 0)
  }

  /// When a queued mutation last replayed successfully.
  pub fn last_sync(&self) -> Result<Option<DateTime<Utc>>> {
    let conn = db::lock(&self.conn)?;
    match db::get_meta(&conn, LAST_SYNC_KEY)? {
      Some(value) => {
        let millis = value
          .parse::<i64>()
          .map_err(|e| eyre!("Corrupt last_sync value {}: {}", value, e))?;
        Ok(Some(db::from_millis(millis)?))
      }
      None => Ok(None),
    }
  }

  fn record_sync(&self, at: DateTime<Utc>) -> Result<()> {
    let conn = db::lock(&self.conn)?;
    db::set_meta(&conn, LAST_SYNC_KEY, &db::to_millis(at).to_string())
  }

  fn acquire_lease(&self) -> Result<bool> {
    let conn = db::lock(&self.conn)?;
    lease::try_acquire(&conn, &self.owner, self.lease_ttl, Utc::now())
  }

  fn release_lease(&self) -> Result<()> {
    let conn = db::lock(&self.conn)?;
    lease::release(&conn, &self.owner)
  }

  /// Send `request` while renewing the lease in the background.
  ///
  /// Returns None, dropping the request, if another context took the lease
  /// before the response arrived.
  async fn send_under_lease(
    &self,
    network: &dyn Network,
    request: &FetchRequest,
  ) -> Result<Option<Result<FetchResponse>>> {
    let period = (self.lease_ttl / 3).max(Duration::from_millis(10));
    let mut renew = tokio::time::interval(period);
    renew.tick().await;

    let send = network.fetch(request);
    tokio::pin!(send);

    loop {
      tokio::select! {
        result = &mut send => return Ok(Some(result)),
        _ = renew.tick() => {
          if !self.acquire_lease()? {
            return Ok(None);
          }
        }
      }
    }
  }

  /// Re-issue every queued mutation in order.
  ///
  /// `on_outcome` is called once per attempted entry. A 2xx deletes the entry;
  /// any other status keeps it and moves on; a network error keeps it and ends
  /// the pass. Only one context drains at a time: if the lease is taken the
  /// pass is skipped.
  pub async fn replay<F>(&self, network: &dyn Network, mut on_outcome: F) -> Result<ReplayReport>
  where
    F: FnMut(&ReplayOutcome),
  {
    let Ok(_local) = self.replaying.try_lock() else {
      debug!("replay already running in this context");
      return self.skipped_report();
    };

    if !self.acquire_lease()? {
      info!("another context is draining the offline queue");
      return self.skipped_report();
    }

    let result = self.drain(network, &mut on_outcome).await;

    if let Err(e) = self.release_lease() {
      warn!(error = %e, "failed to release replay lease");
    }

    let report = result?;
    if report.replayed > 0 || report.failed > 0 {
      info!(
        replayed = report.replayed,
        failed = report.failed,
        remaining = report.remaining,
        "offline queue replay finished"
      );
    }
    Ok(report)
  }

  async fn drain<F>(&self, network: &dyn Network, on_outcome: &mut F) -> Result<ReplayReport>
  where
    F: FnMut(&ReplayOutcome),
  {
    let mut report = ReplayReport::default();

    for entry in self.entries()? {
      let Some(result) = self.send_under_lease(network, &entry.to_request()).await? else {
        warn!(id = %entry.id, "lost replay lease while request was in flight");
        break;
      };

      match result {
        Ok(response) if response.is_success() => {
          self.remove(&entry.id)?;
          if let Err(e) = self.record_sync(Utc::now()) {
            warn!(error = %e, "failed to record last sync time");
          }
          report.replayed += 1;
          on_outcome(&ReplayOutcome {
            id: entry.id,
            success: true,
            status: Some(response.status),
          });
        }
        Ok(response) => {
          warn!(
            id = %entry.id,
            status = response.status,
            url = %entry.url,
            "replay rejected by server; keeping queued"
          );
          report.failed += 1;
          on_outcome(&ReplayOutcome {
            id: entry.id,
            success: false,
            status: Some(response.status),
          });
        }
        Err(e) => {
          warn!(id = %entry.id, error = %e, "replay failed; stopping until next trigger");
          report.failed += 1;
          on_outcome(&ReplayOutcome {
            id: entry.id,
            success: false,
            status: None,
          });
          break;
        }
      }

      if !self.acquire_lease()? {
        warn!("lost replay lease mid-pass");
        break;
      }
    }

    report.remaining = self.len()?;
    Ok(report)
  }

  fn skipped_report(&self) -> Result<ReplayReport> {
    Ok(ReplayReport {
      remaining: self.len()?,
      skipped: true,
      ..Default::default()
    })
  }
}

fn schema() -> String {
  format!("{}{}", QUEUE_SCHEMA, lease::LEASE_SCHEMA)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::http::FetchResponse;
  use crate::testing::FakeNetwork;
  use serde_json::json;

  fn patch(n: u32) -> FetchRequest {
    FetchRequest::new("PATCH", format!("http://a.test/api/tasks/{}", n))
      .with_json(&json!({"title": format!("task {}", n)}))
  }

  #[test]
  fn test_enqueue_preserves_order_and_snapshot() {
    let queue = OfflineQueue::in_memory().unwrap();
    let first = queue.enqueue(&patch(1)).unwrap();
    let second = queue.enqueue(&patch(2)).unwrap();

    let entries = queue.entries().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].id, first.id);
    assert_eq!(entries[1].id, second.id);
    assert_eq!(entries[0].to_request(), patch(1));
  }

  #[tokio::test]
  async fn test_replay_in_order_and_deletes_on_success() {
    let queue = OfflineQueue::in_memory().unwrap();
    for n in 1..=3 {
      queue.enqueue(&patch(n)).unwrap();
    }

    let network = FakeNetwork::new();
    network.respond_to_all(FetchResponse::new(200, "{}"));

    let mut seen = Vec::new();
    let report = queue
      .replay(&network, |outcome| seen.push(outcome.clone()))
      .await
      .unwrap();

    assert_eq!(report.replayed, 3);
    assert_eq!(report.remaining, 0);
    assert!(seen.iter().all(|o| o.success));
    let urls: Vec<String> = network.requests().into_iter().map(|r| r.url).collect();
    assert_eq!(
      urls,
      vec![
        "http://a.test/api/tasks/1",
        "http://a.test/api/tasks/2",
        "http://a.test/api/tasks/3"
      ]
    );
    assert!(queue.last_sync().unwrap().is_some());
  }

  #[tokio::test]
  async fn test_delivery_reported_when_last_sync_cannot_be_written() {
    let queue = OfflineQueue::in_memory().unwrap();
    let delivered = queue.enqueue(&patch(1)).unwrap();
    queue.enqueue(&patch(2)).unwrap();
    db::lock(&queue.conn)
      .unwrap()
      .execute_batch("DROP TABLE meta")
      .unwrap();

    let network = FakeNetwork::new();
    network.respond_to_all(FetchResponse::new(200, "{}"));

    let mut outcomes = Vec::new();
    let report = queue
      .replay(&network, |o| outcomes.push((o.id.clone(), o.success)))
      .await
      .unwrap();

    assert_eq!(report.replayed, 2);
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0], (delivered.id, true));
    assert!(queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_network_error_keeps_entries_and_stops() {
    let queue = OfflineQueue::in_memory().unwrap();
    queue.enqueue(&patch(1)).unwrap();
    queue.enqueue(&patch(2)).unwrap();

    let network = FakeNetwork::new();
    network.set_online(false);

    let report = queue.replay(&network, |_| {}).await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.remaining, 2);
    assert_eq!(network.requests().len(), 1);
    assert!(queue.last_sync().unwrap().is_none());
  }

  #[tokio::test]
  async fn test_rejected_entry_stays_and_later_entries_continue() {
    let queue = OfflineQueue::in_memory().unwrap();
    let rejected = queue.enqueue(&patch(1)).unwrap();
    queue.enqueue(&patch(2)).unwrap();

    let network = FakeNetwork::new();
    network.respond("PATCH", "http://a.test/api/tasks/1", FetchResponse::new(404, ""));
    network.respond("PATCH", "http://a.test/api/tasks/2", FetchResponse::new(200, ""));

    let mut outcomes = Vec::new();
    let report = queue
      .replay(&network, |o| outcomes.push((o.id.clone(), o.success)))
      .await
      .unwrap();

    assert_eq!(report.replayed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(outcomes[0], (rejected.id.clone(), false));
    let remaining = queue.entries().unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, rejected.id);
  }

  struct SlowNetwork {
    inner: FakeNetwork,
    delay: Duration,
  }

  #[async_trait::async_trait]
  impl Network for SlowNetwork {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
      tokio::time::sleep(self.delay).await;
      self.inner.fetch(request).await
    }
  }

  #[tokio::test]
  async fn test_lease_held_through_slow_request() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let ttl = Duration::from_secs(1);
    let tab_a = OfflineQueue::open(&path).unwrap().with_lease_ttl(ttl);
    let tab_b = OfflineQueue::open(&path).unwrap().with_lease_ttl(ttl);
    tab_a.enqueue(&patch(1)).unwrap();

    let network = Arc::new(SlowNetwork {
      inner: FakeNetwork::new(),
      delay: Duration::from_millis(1800),
    });
    network.inner.respond_to_all(FetchResponse::new(200, ""));

    let draining = {
      let queue = tab_a.clone();
      let network = network.clone();
      tokio::spawn(async move { queue.replay(network.as_ref(), |_| {}).await })
    };

    // past the ttl of the lease tab A took when it started
    tokio::time::sleep(Duration::from_millis(1300)).await;
    let report = tab_b.replay(network.as_ref(), |_| {}).await.unwrap();
    assert!(report.skipped);

    let report = draining.await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);
    assert_eq!(network.inner.requests().len(), 1);
    assert!(tab_b.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_second_context_skips_while_lease_held() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let tab_a = OfflineQueue::open(&path).unwrap();
    let tab_b = OfflineQueue::open(&path).unwrap();

    tab_a.enqueue(&patch(1)).unwrap();
    assert_eq!(tab_b.len().unwrap(), 1);

    // tab A is mid-drain
    assert!(tab_a.acquire_lease().unwrap());

    let network = FakeNetwork::new();
    network.respond_to_all(FetchResponse::new(200, ""));
    let report = tab_b.replay(&network, |_| {}).await.unwrap();

    assert!(report.skipped);
    assert_eq!(report.remaining, 1);
    assert!(network.requests().is_empty());

    tab_a.release_lease().unwrap();
    let report = tab_b.replay(&network, |_| {}).await.unwrap();
    assert_eq!(report.replayed, 1);
    assert!(tab_a.is_empty().unwrap());
  }
}
