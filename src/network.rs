//! The transport seam and the online/offline signal.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::watch;

use crate::http::{FetchRequest, FetchResponse};

/// Something that can carry a request to the origin.
///
/// `Err` means the request never produced a response (DNS, refused, reset...).
/// HTTP error statuses are returned as `Ok` responses.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse>;
}

/// Network transport backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .user_agent(concat!("weatherproof/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    let method = Method::from_bytes(request.method.as_bytes())
      .map_err(|e| eyre!("Invalid method {}: {}", request.method, e))?;

    let mut builder = self.client.request(method, &request.url);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| eyre!("{} {} failed: {}", request.method, request.url, e))?;

    let status = response.status().as_u16();
    let mut fetched = FetchResponse::new(status, Vec::new());
    for (name, value) in response.headers() {
      if let Ok(value) = value.to_str() {
        fetched = fetched.with_header(name.as_str(), value);
      }
    }

    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;
    fetched.body = body.to_vec();

    Ok(fetched)
  }
}

/// Shared online/offline flag, the equivalent of `navigator.onLine` plus its events.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx: Arc::new(tx) }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Returns true if the value changed.
  pub fn set_online(&self, online: bool) -> bool {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    })
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

/// A transport that fails fast whenever `connectivity` reports offline.
pub struct GatedNetwork {
  inner: Arc<dyn Network>,
  connectivity: Connectivity,
}

impl GatedNetwork {
  pub fn new(inner: Arc<dyn Network>, connectivity: Connectivity) -> Self {
    Self {
      inner,
      connectivity,
    }
  }
}

#[async_trait]
impl Network for GatedNetwork {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    if !self.connectivity.is_online() {
      return Err(eyre!("Offline: {} {} not sent", request.method, request.url));
    }
    self.inner.fetch(request).await
  }
}
