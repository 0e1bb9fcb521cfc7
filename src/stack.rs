//! Wiring of one client instance: guard, worker, caches, queue and coherency.

use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheStorage, CacheTierManager, SqliteCacheStorage};
use crate::coherency::{CoherencyMonitor, ReloadRequest, VersionSource};
use crate::config::Config;
use crate::guard::{BreakerConfig, BreakerRegistry, GuardConfig, RequestGuard, ResilientClient};
use crate::http::{FetchRequest, FetchResponse};
use crate::network::{Connectivity, Network};
use crate::queue::OfflineQueue;
use crate::worker::{Lifecycle, Worker, WorkerChannel, WorkerHandle};

pub struct ClientStack {
  connectivity: Connectivity,
  queue: OfflineQueue,
  worker: WorkerChannel,
  lifecycle: WorkerHandle,
  client: ResilientClient,
  monitor: Arc<CoherencyMonitor>,
  navigations: Option<mpsc::Sender<()>>,
  tasks: Vec<JoinHandle<()>>,
}

impl ClientStack {
  /// Open the on-disk stores named by `config` and start the worker.
  pub async fn from_config(
    config: &Config,
    network: Arc<dyn Network>,
    source: Arc<dyn VersionSource>,
    connectivity: Connectivity,
  ) -> Result<Self> {
    let storage = SqliteCacheStorage::open(&config.cache_db_path()?)?;
    let queue = OfflineQueue::open(&config.queue_db_path()?)?.with_lease_ttl(config.lease_ttl());
    let manager = CacheTierManager::new(
      storage,
      network,
      queue,
      connectivity,
      config.cache_settings()?,
    );

    Self::start(
      manager,
      config.guard.to_config(),
      config.breaker.to_config(),
      config.message_timeout(),
      source,
    )
    .await
  }

  /// Spawn the worker around `manager`, install and activate it.
  ///
  /// A failed install is logged and leaves the worker redundant; requests then
  /// go straight to the network.
  pub async fn start<S: CacheStorage + 'static>(
    manager: CacheTierManager<S>,
    guard_config: GuardConfig,
    breaker_config: BreakerConfig,
    message_timeout: Duration,
    source: Arc<dyn VersionSource>,
  ) -> Result<Self> {
    let connectivity = manager.connectivity().clone();
    let queue = manager.queue().clone();
    let (worker, lifecycle) = Worker::new(manager).spawn(message_timeout);

    match worker.install().await {
      Ok(report) => {
        let deleted = worker.activate().await?;
        info!(
          version = %report.version,
          precached = report.required + report.optional_cached,
          stale_stores = deleted.len(),
          "client stack ready"
        );
      }
      Err(e) => warn!(error = %e, "worker install failed; running without interception"),
    }

    let guard = Arc::new(RequestGuard::new(guard_config));
    let sweeper = guard.spawn_sweeper();
    let client = ResilientClient::new(
      Arc::new(worker.clone()),
      guard,
      Arc::new(BreakerRegistry::new(breaker_config)),
    );
    let monitor = Arc::new(CoherencyMonitor::new(source, worker.clone()));

    Ok(Self {
      connectivity,
      queue,
      worker,
      lifecycle,
      client,
      monitor,
      navigations: None,
      tasks: vec![sweeper],
    })
  }

  /// Start periodic coherency polling. Navigations through [`Self::fetch`]
  /// trigger an extra poll.
  pub fn watch_coherency(&mut self, interval: Duration) -> broadcast::Receiver<ReloadRequest> {
    let (tx, rx) = mpsc::channel(8);
    let reloads = self.monitor.subscribe_reloads();
    self.tasks.push(self.monitor.clone().spawn(interval, rx));
    self.navigations = Some(tx);
    reloads
  }

  /// Send a request the way the UI would.
  pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    if request.navigation {
      if let Some(navigations) = &self.navigations {
        // A poll already pending covers this navigation too
        let _ = navigations.try_send(());
      }
    }
    self.client.fetch(request).await
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn worker(&self) -> &WorkerChannel {
    &self.worker
  }

  pub fn lifecycle(&self) -> Lifecycle {
    self.lifecycle.lifecycle()
  }

  pub fn client(&self) -> &ResilientClient {
    &self.client
  }

  pub fn monitor(&self) -> &Arc<CoherencyMonitor> {
    &self.monitor
  }
}

impl Drop for ClientStack {
  fn drop(&mut self) {
    for task in &self.tasks {
      task.abort();
    }
  }
}
