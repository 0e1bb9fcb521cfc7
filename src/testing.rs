//! Scripted in-memory transport for unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::http::{FetchRequest, FetchResponse};
use crate::network::Network;

pub struct FakeNetwork {
  online: AtomicBool,
  routes: Mutex<HashMap<(String, String), FetchResponse>>,
  fallback: Mutex<Option<FetchResponse>>,
  log: Mutex<Vec<FetchRequest>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      fallback: Mutex::new(None),
      log: Mutex::new(Vec::new()),
    }
  }

  pub fn respond(&self, method: &str, url: &str, response: FetchResponse) {
    self
      .routes
      .lock()
      .insert((method.to_string(), url.to_string()), response);
  }

  pub fn respond_to_all(&self, response: FetchResponse) {
    *self.fallback.lock() = Some(response);
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Every request that reached the transport, including failed ones.
  pub fn requests(&self) -> Vec<FetchRequest> {
    self.log.lock().clone()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    self.log.lock().push(request.clone());

    if !self.online.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable: {}", request.url));
    }

    let key = (request.method.clone(), request.url.clone());
    if let Some(response) = self.routes.lock().get(&key) {
      return Ok(response.clone());
    }
    if let Some(response) = self.fallback.lock().as_ref() {
      return Ok(response.clone());
    }
    Ok(FetchResponse::new(404, "not found"))
  }
}
