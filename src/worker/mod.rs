//! Background worker context.
//!
//! A single dispatch loop receives lifecycle, fetch, message and sync events
//! and runs each one as its own task. Pages talk to it through a
//! [`WorkerChannel`].

mod channel;
mod protocol;

use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStorage, CacheTierManager, InstallReport, Tier};
use crate::http::{FetchRequest, FetchResponse};
use crate::queue::ReplayReport;

pub use channel::{WorkerChannel, DEFAULT_MESSAGE_TIMEOUT};
pub use protocol::{Envelope, PageMessage, WorkerMessage, SYNC_TAGS};

/// Events delivered to the worker.
pub(crate) enum WorkerEvent {
  Install {
    reply: oneshot::Sender<Result<InstallReport>>,
  },
  Activate {
    reply: oneshot::Sender<Result<Vec<String>>>,
  },
  Fetch {
    request: FetchRequest,
    reply: oneshot::Sender<Result<FetchResponse>>,
  },
  Message {
    envelope: Envelope<PageMessage>,
    reply: oneshot::Sender<Envelope<WorkerMessage>>,
  },
  Sync {
    tag: String,
    reply: oneshot::Sender<Result<Option<ReplayReport>>>,
  },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Lifecycle {
  Parsed,
  Installing,
  Installed,
  Activating,
  /// Controls its clients and intercepts their fetches
  Activated,
  /// Install failed; this version never activates
  Redundant,
}

pub struct Worker<S: CacheStorage + 'static> {
  inner: Arc<WorkerInner<S>>,
}

struct WorkerInner<S: CacheStorage> {
  manager: CacheTierManager<S>,
  lifecycle: Mutex<Lifecycle>,
  notify: broadcast::Sender<WorkerMessage>,
}

impl<S: CacheStorage + 'static> Worker<S> {
  pub fn new(manager: CacheTierManager<S>) -> Self {
    let (notify, _rx) = broadcast::channel(256);
    Self {
      inner: Arc::new(WorkerInner {
        manager,
        lifecycle: Mutex::new(Lifecycle::Parsed),
        notify,
      }),
    }
  }

  /// Start the dispatch loop and the connectivity watcher.
  pub fn spawn(self, message_timeout: Duration) -> (WorkerChannel, WorkerHandle) {
    let (tx, mut rx) = mpsc::unbounded_channel::<WorkerEvent>();
    let channel = WorkerChannel::new(tx, self.inner.notify.clone(), message_timeout);

    let inner = self.inner.clone();
    tokio::spawn(async move {
      while let Some(event) = rx.recv().await {
        let inner = inner.clone();
        tokio::spawn(async move { inner.dispatch(event).await });
      }
      debug!("worker dispatch loop stopped");
    });

    let weak: Weak<WorkerInner<S>> = Arc::downgrade(&self.inner);
    let mut online = self.inner.manager.connectivity().subscribe();
    tokio::spawn(async move {
      online.borrow_and_update();
      // Only real transitions notify, so seeing `true` here means we were offline
      while online.changed().await.is_ok() {
        let Some(inner) = weak.upgrade() else {
          break;
        };
        if *online.borrow_and_update() {
          info!("connectivity restored; replaying offline queue");
          if let Err(e) = inner.replay().await {
            warn!(error = %e, "offline queue replay failed");
          }
        }
      }
    });

    let handle = WorkerHandle {
      inner: self.inner as Arc<dyn LifecycleView>,
    };
    (channel, handle)
  }
}

/// Read-only view on a spawned worker's state.
#[derive(Clone)]
pub struct WorkerHandle {
  inner: Arc<dyn LifecycleView>,
}

impl WorkerHandle {
  pub fn lifecycle(&self) -> Lifecycle {
    self.inner.lifecycle()
  }
}

trait LifecycleView: Send + Sync {
  fn lifecycle(&self) -> Lifecycle;
}

impl<S: CacheStorage> LifecycleView for WorkerInner<S> {
  fn lifecycle(&self) -> Lifecycle {
    *self.lifecycle.lock()
  }
}

impl<S: CacheStorage> WorkerInner<S> {
  fn set_lifecycle(&self, next: Lifecycle) {
    let mut lifecycle = self.lifecycle.lock();
    debug!(from = ?*lifecycle, to = ?next, "worker lifecycle");
    *lifecycle = next;
  }

  async fn dispatch(&self, event: WorkerEvent) {
    match event {
      WorkerEvent::Install { reply } => {
        let _ = reply.send(self.install().await);
      }
      WorkerEvent::Activate { reply } => {
        let _ = reply.send(self.activate());
      }
      WorkerEvent::Fetch { request, reply } => {
        let _ = reply.send(self.fetch(&request).await);
      }
      WorkerEvent::Message { envelope, reply } => {
        let payload = self.handle_message(envelope.payload).await;
        let _ = reply.send(Envelope {
          id: envelope.id,
          payload,
        });
      }
      WorkerEvent::Sync { tag, reply } => {
        let _ = reply.send(self.sync(&tag).await);
      }
    }
  }

  async fn install(&self) -> Result<InstallReport> {
    self.set_lifecycle(Lifecycle::Installing);
    match self.manager.install().await {
      Ok(report) => {
        self.set_lifecycle(Lifecycle::Installed);
        Ok(report)
      }
      Err(e) => {
        error!(error = %e, "install failed; this version will not activate");
        self.set_lifecycle(Lifecycle::Redundant);
        Err(e)
      }
    }
  }

  fn activate(&self) -> Result<Vec<String>> {
    let current = *self.lifecycle.lock();
    if !matches!(current, Lifecycle::Installed | Lifecycle::Activated) {
      return Err(eyre!("Cannot activate a worker that is {:?}", current));
    }

    self.set_lifecycle(Lifecycle::Activating);
    match self.manager.activate() {
      Ok(deleted) => {
        // Claim: every fetch from here on goes through the cache tiers
        self.set_lifecycle(Lifecycle::Activated);
        info!(
          version = %self.manager.tiers().version(),
          deleted = deleted.len(),
          "worker activated and claimed clients"
        );
        Ok(deleted)
      }
      Err(e) => {
        self.set_lifecycle(current);
        Err(e)
      }
    }
  }

  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    if *self.lifecycle.lock() == Lifecycle::Activated {
      self.manager.handle_fetch(request).await
    } else {
      self.manager.network().fetch(request).await
    }
  }

  async fn sync(&self, tag: &str) -> Result<Option<ReplayReport>> {
    if SYNC_TAGS.contains(&tag) {
      self.replay().await.map(Some)
    } else {
      debug!(tag = %tag, "ignoring unknown sync tag");
      Ok(None)
    }
  }

  async fn replay(&self) -> Result<ReplayReport> {
    let notify = self.notify.clone();
    self
      .manager
      .queue()
      .replay(self.manager.network().as_ref(), move |outcome| {
        // No subscribers is fine
        let _ = notify.send(WorkerMessage::SyncComplete {
          request_id: outcome.id.clone(),
          success: outcome.success,
        });
      })
      .await
  }

  async fn handle_message(&self, message: PageMessage) -> WorkerMessage {
    let kind = message.kind();
    let result = match message {
      PageMessage::ClearApiCache => self
        .manager
        .purge(&[Tier::Api])
        .map(|stores| WorkerMessage::CacheCleared { stores }),
      PageMessage::ClearAllCache => self
        .manager
        .purge(&Tier::ALL)
        .map(|stores| WorkerMessage::CacheCleared { stores }),
      PageMessage::ProcessOfflineQueue => {
        self
          .replay()
          .await
          .map(|report| WorkerMessage::QueueProcessed {
            replayed: report.replayed,
            failed: report.failed,
            remaining: report.remaining,
            skipped: report.skipped,
          })
      }
      PageMessage::GetCacheStatus { url } => self.cache_status(&url),
    };

    result.unwrap_or_else(|e| {
      warn!(message = kind, error = %e, "worker message failed");
      WorkerMessage::Error {
        message: e.to_string(),
      }
    })
  }

  fn cache_status(&self, url: &str) -> Result<WorkerMessage> {
    let status = self.manager.cache_status(url)?;
    let last_sync = self.manager.queue().last_sync()?;
    Ok(WorkerMessage::CacheStatus {
      is_from_cache: status.is_from_cache,
      cache_date: status.cache_date,
      last_sync,
      url: status.url,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSettings, CacheTiers, SqliteCacheStorage};
  use crate::network::{Connectivity, Network};
  use crate::queue::OfflineQueue;
  use crate::testing::FakeNetwork;
  use serde_json::json;

  const ORIGIN: &str = "http://a.test";

  struct Fixture {
    network: Arc<FakeNetwork>,
    connectivity: Connectivity,
    queue: OfflineQueue,
    channel: WorkerChannel,
    handle: WorkerHandle,
  }

  fn spawn_worker() -> Fixture {
    let network = Arc::new(FakeNetwork::new());
    network.respond_to_all(FetchResponse::new(200, "ok"));
    let connectivity = Connectivity::new(true);
    let queue = OfflineQueue::in_memory().unwrap();
    let settings = CacheSettings {
      tiers: CacheTiers::new("wp", "v1"),
      api_prefix: "/api/".to_string(),
      static_extensions: vec!["js".to_string()],
      offline_page: format!("{}/offline.html", ORIGIN),
      precache_required: vec![format!("{}/", ORIGIN)],
      precache_optional: Vec::new(),
    };
    let manager = CacheTierManager::new(
      SqliteCacheStorage::in_memory().unwrap(),
      network.clone(),
      queue.clone(),
      connectivity.clone(),
      settings,
    );
    let (channel, handle) = Worker::new(manager).spawn(DEFAULT_MESSAGE_TIMEOUT);
    Fixture {
      network,
      connectivity,
      queue,
      channel,
      handle,
    }
  }

  fn tasks_url() -> String {
    format!("{}/api/tasks", ORIGIN)
  }

  #[tokio::test]
  async fn test_fetches_bypass_cache_until_activated() {
    let f = spawn_worker();
    f.network.respond("GET", &tasks_url(), FetchResponse::new(200, "[1]"));

    f.channel.fetch(&FetchRequest::get(tasks_url())).await.unwrap();
    f.network.set_online(false);
    assert!(f.channel.fetch(&FetchRequest::get(tasks_url())).await.is_err());

    f.network.set_online(true);
    f.channel.install().await.unwrap();
    f.channel.activate().await.unwrap();
    assert_eq!(f.handle.lifecycle(), Lifecycle::Activated);

    f.channel.fetch(&FetchRequest::get(tasks_url())).await.unwrap();
    f.network.set_online(false);
    let cached = f.channel.fetch(&FetchRequest::get(tasks_url())).await.unwrap();
    assert!(cached.is_from_cache());
    assert_eq!(cached.text(), "[1]");
  }

  #[tokio::test]
  async fn test_failed_install_makes_worker_redundant() {
    let f = spawn_worker();
    f.network.set_online(false);

    assert!(f.channel.install().await.is_err());
    assert_eq!(f.handle.lifecycle(), Lifecycle::Redundant);
    assert!(f.channel.activate().await.is_err());
  }

  #[tokio::test]
  async fn test_cache_status_and_clear_messages() {
    let f = spawn_worker();
    f.channel.install().await.unwrap();
    f.channel.activate().await.unwrap();
    f.channel.fetch(&FetchRequest::get(tasks_url())).await.unwrap();

    let reply = f
      .channel
      .request(PageMessage::GetCacheStatus { url: tasks_url() })
      .await
      .unwrap();
    match reply {
      WorkerMessage::CacheStatus {
        is_from_cache,
        cache_date,
        url,
        ..
      } => {
        assert!(is_from_cache);
        assert!(cache_date.is_some());
        assert_eq!(url, tasks_url());
      }
      other => panic!("unexpected reply {:?}", other),
    }

    let reply = f.channel.request(PageMessage::ClearApiCache).await.unwrap();
    assert_eq!(
      reply,
      WorkerMessage::CacheCleared {
        stores: vec!["wp-api-v1".to_string()]
      }
    );
  }

  #[tokio::test]
  async fn test_sync_event_replays_and_broadcasts() {
    let f = spawn_worker();
    f.channel.install().await.unwrap();
    f.channel.activate().await.unwrap();

    f.connectivity.set_online(false);
    f.network.set_online(false);
    let queued = f
      .channel
      .fetch(&FetchRequest::new("POST", tasks_url()).with_json(&json!({"title": "a"})))
      .await
      .unwrap();
    let id = queued.queued_request_id().unwrap().to_string();

    let mut events = f.channel.subscribe();
    f.network.set_online(true);
    assert!(f.channel.sync("unrelated-tag").await.unwrap().is_none());
    let report = f.channel.sync("offline-queue-sync").await.unwrap().unwrap();
    assert_eq!(report.replayed, 1);

    assert_eq!(
      events.recv().await.unwrap(),
      WorkerMessage::SyncComplete {
        request_id: id,
        success: true
      }
    );
    assert!(f.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_worker_released_once_pages_are_gone() {
    let connectivity = Connectivity::new(true);
    let manager = CacheTierManager::new(
      SqliteCacheStorage::in_memory().unwrap(),
      Arc::new(FakeNetwork::new()),
      OfflineQueue::in_memory().unwrap(),
      connectivity.clone(),
      CacheSettings {
        tiers: CacheTiers::new("wp", "v1"),
        api_prefix: "/api/".to_string(),
        static_extensions: Vec::new(),
        offline_page: format!("{}/offline.html", ORIGIN),
        precache_required: Vec::new(),
        precache_optional: Vec::new(),
      },
    );
    let worker = Worker::new(manager);
    let weak = Arc::downgrade(&worker.inner);
    let (channel, handle) = worker.spawn(DEFAULT_MESSAGE_TIMEOUT);

    drop(channel);
    drop(handle);
    tokio::time::timeout(Duration::from_secs(5), async {
      while weak.strong_count() > 0 {
        tokio::time::sleep(Duration::from_millis(10)).await;
      }
    })
    .await
    .unwrap();
    assert!(connectivity.is_online());
  }

  #[tokio::test]
  async fn test_reconnect_triggers_replay() {
    let f = spawn_worker();
    f.channel.install().await.unwrap();
    f.channel.activate().await.unwrap();

    f.connectivity.set_online(false);
    f.network.set_online(false);
    for n in 1..=2 {
      let request = FetchRequest::new("PUT", format!("{}/api/tasks/{}", ORIGIN, n)).with_body("{}");
      f.channel.fetch(&request).await.unwrap();
    }
    assert_eq!(f.queue.len().unwrap(), 2);

    let mut events = f.channel.subscribe();
    f.network.set_online(true);
    f.connectivity.set_online(true);

    for _ in 0..2 {
      let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap();
      assert!(matches!(event, WorkerMessage::SyncComplete { success: true, .. }));
    }
    assert!(f.queue.is_empty().unwrap());

    let replayed: Vec<String> = f
      .network
      .requests()
      .into_iter()
      .filter(|r| r.method == "PUT")
      .map(|r| r.url)
      .collect();
    // each mutation was tried once offline, then once on replay, in order
    assert_eq!(
      replayed,
      vec![
        format!("{}/api/tasks/1", ORIGIN),
        format!("{}/api/tasks/2", ORIGIN),
        format!("{}/api/tasks/1", ORIGIN),
        format!("{}/api/tasks/2", ORIGIN),
      ]
    );
  }
}
