//! Client side of the coherency protocol: poll the epoch, purge, ask for reloads.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::server::{InvalidateRequest, InvalidateResponse, StatusResponse};
use super::state::{CacheVersionState, InvalidationAction, InvalidationRecord, VersionSource};
use crate::worker::{PageMessage, WorkerChannel, WorkerMessage};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// HTTP client for the control plane.
#[derive(Clone)]
pub struct ControlPlaneClient {
  http: reqwest::Client,
  /// Full URL of the status endpoint, e.g. `https://admin.example/api/cache-control`
  endpoint: String,
  token: Option<String>,
}

impl ControlPlaneClient {
  pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Result<Self> {
    let http = reqwest::Client::builder()
      .user_agent(concat!("weatherproof/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      http,
      endpoint: endpoint.into().trim_end_matches('/').to_string(),
      token,
    })
  }

  fn token(&self) -> Result<&str> {
    self.token.as_deref().ok_or_else(|| {
      eyre!("Operator token not found. Set WEATHERPROOF_ADMIN_TOKEN or CACHE_ADMIN_TOKEN environment variable.")
    })
  }

  async fn read<T: DeserializeOwned>(&self, response: reqwest::Response, what: &str) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
      let text = response.text().await.unwrap_or_default();
      return Err(eyre!("{} failed ({}): {}", what, status, text));
    }
    response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse {} response: {}", what, e))
  }

  pub async fn invalidate(
    &self,
    action: InvalidationAction,
    reason: Option<&str>,
  ) -> Result<InvalidateResponse> {
    let response = self
      .http
      .post(&self.endpoint)
      .bearer_auth(self.token()?)
      .json(&InvalidateRequest {
        action: action.as_str().to_string(),
        reason: reason.map(str::to_string),
      })
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach control plane: {}", e))?;

    self.read(response, action.as_str()).await
  }

  pub async fn history(&self, limit: usize) -> Result<Vec<InvalidationRecord>> {
    let response = self
      .http
      .get(format!("{}/history", self.endpoint))
      .query(&[("limit", limit)])
      .bearer_auth(self.token()?)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach control plane: {}", e))?;

    self.read(response, "history").await
  }
}

#[async_trait]
impl VersionSource for ControlPlaneClient {
  async fn status(&self) -> Result<CacheVersionState> {
    let response = self
      .http
      .get(&self.endpoint)
      .send()
      .await
      .map_err(|e| eyre!("Failed to reach control plane: {}", e))?;

    let status: StatusResponse = self.read(response, "status").await?;
    Ok(CacheVersionState {
      current_version: status.current_version,
      last_invalidation: status.last_invalidation,
      force_update: status.force_update,
    })
  }
}

/// What a client should do after looking at the server's epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoherencyAction {
  None,
  PurgeApi,
  PurgeAllAndReload,
}

/// Remembers the last epoch seen by one client.
#[derive(Debug, Clone, Default)]
pub struct CoherencyTracker {
  last_version: Option<u64>,
  /// Version whose forced update was already acted on
  forced_version: Option<u64>,
}

impl CoherencyTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn last_version(&self) -> Option<u64> {
    self.last_version
  }

  pub fn evaluate(&mut self, state: &CacheVersionState) -> CoherencyAction {
    let previous = self.last_version.replace(state.current_version);

    if state.force_update {
      // One reload per forced version, or clients would reload on every poll
      if self.forced_version == Some(state.current_version) {
        return CoherencyAction::None;
      }
      self.forced_version = Some(state.current_version);
      return CoherencyAction::PurgeAllAndReload;
    }

    match previous {
      Some(seen) if state.current_version > seen => CoherencyAction::PurgeApi,
      _ => CoherencyAction::None,
    }
  }
}

/// Asks the host to reload every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReloadRequest {
  pub version: u64,
}

/// Polls a [`VersionSource`] and drives purges through the worker.
pub struct CoherencyMonitor {
  source: Arc<dyn VersionSource>,
  worker: WorkerChannel,
  tracker: Mutex<CoherencyTracker>,
  reload: broadcast::Sender<ReloadRequest>,
}

impl CoherencyMonitor {
  pub fn new(source: Arc<dyn VersionSource>, worker: WorkerChannel) -> Self {
    let (reload, _rx) = broadcast::channel(16);
    Self {
      source,
      worker,
      tracker: Mutex::new(CoherencyTracker::new()),
      reload,
    }
  }

  pub fn subscribe_reloads(&self) -> broadcast::Receiver<ReloadRequest> {
    self.reload.subscribe()
  }

  /// Poll once and act on the result.
  ///
  /// The tracker only moves to the new version once its purge went through,
  /// so a failed purge is retried on the next poll.
  pub async fn check_now(&self) -> Result<CoherencyAction> {
    let state = self.source.status().await?;
    let mut tracker = self.tracker.lock().await;
    let mut next = tracker.clone();
    let action = next.evaluate(&state);

    match action {
      CoherencyAction::None => {
        debug!(version = state.current_version, "cache version unchanged");
      }
      CoherencyAction::PurgeApi => {
        info!(version = state.current_version, "cache version advanced; purging api cache");
        self.send(PageMessage::ClearApiCache).await?;
      }
      CoherencyAction::PurgeAllAndReload => {
        info!(version = state.current_version, "forced update; purging all caches");
        self.send(PageMessage::ClearAllCache).await?;
      }
    }

    *tracker = next;
    drop(tracker);

    if action == CoherencyAction::PurgeAllAndReload {
      let _ = self.reload.send(ReloadRequest {
        version: state.current_version,
      });
    }
    Ok(action)
  }

  async fn send(&self, message: PageMessage) -> Result<()> {
    match self.worker.request(message).await? {
      WorkerMessage::Error { message } => Err(eyre!("Worker failed to purge: {}", message)),
      _ => Ok(()),
    }
  }

  /// Poll every `interval` and whenever a navigation is reported.
  pub fn spawn(
    self: Arc<Self>,
    interval: Duration,
    mut navigations: mpsc::Receiver<()>,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      let mut navigating = true;

      loop {
        tokio::select! {
          _ = ticker.tick() => {}
          nav = navigations.recv(), if navigating => {
            if nav.is_none() {
              navigating = false;
              continue;
            }
          }
        }

        if let Err(e) = self.check_now().await {
          warn!(error = %e, "cache version check failed");
        }
      }
    })
  }
}
