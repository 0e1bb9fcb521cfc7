//! Page-side handle on a running worker.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};

use super::protocol::{Envelope, PageMessage, WorkerMessage};
use super::WorkerEvent;
use crate::cache::InstallReport;
use crate::http::{FetchRequest, FetchResponse};
use crate::network::Network;
use crate::queue::ReplayReport;

pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(10);

/// Request/response channel to the worker with correlation ids and timeouts.
///
/// Also acts as the page's network: fetches sent through it are intercepted
/// by the worker exactly as browser fetches would be.
#[derive(Clone)]
pub struct WorkerChannel {
  tx: mpsc::UnboundedSender<WorkerEvent>,
  notify: broadcast::Sender<WorkerMessage>,
  next_id: Arc<AtomicU64>,
  timeout: Duration,
}

impl WorkerChannel {
  pub(super) fn new(
    tx: mpsc::UnboundedSender<WorkerEvent>,
    notify: broadcast::Sender<WorkerMessage>,
    timeout: Duration,
  ) -> Self {
    Self {
      tx,
      notify,
      next_id: Arc::new(AtomicU64::new(1)),
      timeout,
    }
  }

  /// Broadcasts such as `SYNC_COMPLETE`.
  pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
    self.notify.subscribe()
  }

  fn send(&self, event: WorkerEvent) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Worker is not running"))
  }

  pub async fn install(&self) -> Result<InstallReport> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerEvent::Install { reply })?;
    rx.await.map_err(|_| eyre!("Worker dropped install"))?
  }

  pub async fn activate(&self) -> Result<Vec<String>> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerEvent::Activate { reply })?;
    rx.await.map_err(|_| eyre!("Worker dropped activate"))?
  }

  /// Fire a background-sync event. Returns None if the tag is not one the worker handles.
  pub async fn sync(&self, tag: &str) -> Result<Option<ReplayReport>> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerEvent::Sync {
      tag: tag.to_string(),
      reply,
    })?;
    rx.await.map_err(|_| eyre!("Worker dropped sync {}", tag))?
  }

  /// Send a control message and wait for its correlated reply.
  pub async fn request(&self, message: PageMessage) -> Result<WorkerMessage> {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let kind = message.kind();
    let (reply, rx) = oneshot::channel();

    self.send(WorkerEvent::Message {
      envelope: Envelope {
        id,
        payload: message,
      },
      reply,
    })?;

    let envelope = tokio::time::timeout(self.timeout, rx)
      .await
      .map_err(|_| eyre!("Worker did not answer {} within {:?}", kind, self.timeout))?
      .map_err(|_| eyre!("Worker dropped {} request", kind))?;

    if envelope.id != id {
      return Err(eyre!(
        "Reply to {} carried id {}, expected {}",
        kind,
        envelope.id,
        id
      ));
    }

    Ok(envelope.payload)
  }
}

#[async_trait]
impl Network for WorkerChannel {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    let (reply, rx) = oneshot::channel();
    self.send(WorkerEvent::Fetch {
      request: request.clone(),
      reply,
    })?;
    rx.await
      .map_err(|_| eyre!("Worker dropped fetch of {}", request.url))?
  }
}
