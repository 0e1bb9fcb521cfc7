//! Fetch interception across the static, api and offline tiers.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, try_join_all};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::classify::{Classifier, ResourceClass};
use super::fallback::{offline_payload, queued_response, OFFLINE_HTML};
use super::store::{parse_shadow_url, CacheEntry, CacheStorage};
use super::tiers::{CacheTiers, Tier};
use crate::http::{FetchRequest, FetchResponse, SERVED_FROM_HEADER};
use crate::network::{Connectivity, Network};
use crate::queue::OfflineQueue;

/// What to cache and how to classify requests, with all URLs already absolute.
#[derive(Debug, Clone)]
pub struct CacheSettings {
  pub tiers: CacheTiers,
  pub api_prefix: String,
  pub static_extensions: Vec<String>,
  /// Always part of the mandatory precache set; stored in the offline tier
  pub offline_page: String,
  /// Install fails if any of these cannot be fetched
  pub precache_required: Vec<String>,
  /// Best effort
  pub precache_optional: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InstallReport {
  pub version: String,
  pub required: usize,
  pub optional_cached: usize,
  pub optional_failed: Vec<String>,
}

/// Answer to `GET_CACHE_STATUS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStatus {
  pub url: String,
  pub is_from_cache: bool,
  pub cache_date: Option<DateTime<Utc>>,
}

/// Decides, per intercepted request, whether the cache or the network answers.
pub struct CacheTierManager<S: CacheStorage> {
  storage: Arc<S>,
  network: Arc<dyn Network>,
  queue: OfflineQueue,
  connectivity: Connectivity,
  classifier: Classifier,
  settings: CacheSettings,
}

impl<S: CacheStorage> CacheTierManager<S> {
  pub fn new(
    storage: S,
    network: Arc<dyn Network>,
    queue: OfflineQueue,
    connectivity: Connectivity,
    settings: CacheSettings,
  ) -> Self {
    let precached_paths: Vec<String> = settings
      .precache_required
      .iter()
      .chain(settings.precache_optional.iter())
      .map(|url| FetchRequest::get(url.clone()).path())
      .collect();
    let classifier = Classifier::new(
      &settings.api_prefix,
      &settings.static_extensions,
      &precached_paths,
    );

    Self {
      storage: Arc::new(storage),
      network,
      queue,
      connectivity,
      classifier,
      settings,
    }
  }

  pub fn tiers(&self) -> &CacheTiers {
    &self.settings.tiers
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  pub fn network(&self) -> &Arc<dyn Network> {
    &self.network
  }

  pub fn queue(&self) -> &OfflineQueue {
    &self.queue
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  fn store(&self, tier: Tier) -> String {
    self.settings.tiers.store_name(tier)
  }

  /// Pre-warm the current version's stores.
  ///
  /// The mandatory set is fetched completely before anything is written, so a
  /// failed install leaves no partial mandatory content behind.
  pub async fn install(&self) -> Result<InstallReport> {
    let version = self.settings.tiers.version().to_string();
    info!(version = %version, "installing cache version");

    for name in self.settings.tiers.current_names() {
      self.storage.open_store(&name)?;
    }

    let mut required_urls = self.settings.precache_required.clone();
    if !required_urls.contains(&self.settings.offline_page) {
      required_urls.push(self.settings.offline_page.clone());
    }

    let fetched = try_join_all(required_urls.into_iter().map(|url| async move {
      let response = self
        .network
        .fetch(&FetchRequest::get(url.clone()))
        .await
        .map_err(|e| eyre!("Failed to precache {}: {}", url, e))?;
      if !response.is_success() {
        return Err(eyre!(
          "Failed to precache {}: status {}",
          url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((url, response))
    }))
    .await?;

    for (url, response) in &fetched {
      let tier = if *url == self.settings.offline_page {
        Tier::Offline
      } else {
        Tier::Static
      };
      self.storage.put(&self.store(tier), "GET", url, response)?;
    }

    let mut optional_cached = 0;
    let mut optional_failed = Vec::new();
    let optional = join_all(self.settings.precache_optional.iter().map(|url| async move {
      (url, self.network.fetch(&FetchRequest::get(url.clone())).await)
    }))
    .await;

    for (url, result) in optional {
      match result {
        Ok(response) if response.is_success() => {
          match self.storage.put(&self.store(Tier::Static), "GET", url, &response) {
            Ok(()) => optional_cached += 1,
            Err(e) => {
              warn!(url = %url, error = %e, "failed to store optional precache entry");
              optional_failed.push(url.clone());
            }
          }
        }
        Ok(response) => {
          warn!(url = %url, status = response.status, "optional precache skipped");
          optional_failed.push(url.clone());
        }
        Err(e) => {
          warn!(url = %url, error = %e, "optional precache skipped");
          optional_failed.push(url.clone());
        }
      }
    }

    info!(
      version = %version,
      required = fetched.len(),
      optional = optional_cached,
      "cache version installed"
    );

    Ok(InstallReport {
      version,
      required: fetched.len(),
      optional_cached,
      optional_failed,
    })
  }

  /// Delete every store that does not belong to the current version.
  ///
  /// Returns the names of the deleted stores. Running it again is a no-op.
  pub fn activate(&self) -> Result<Vec<String>> {
    let mut deleted = Vec::new();

    for name in self.storage.store_names()? {
      if self.settings.tiers.is_current(&name) {
        continue;
      }
      if self.storage.delete_store(&name)? {
        info!(store = %name, "deleted stale cache store");
        deleted.push(name);
      }
    }

    for name in self.settings.tiers.current_names() {
      self.storage.open_store(&name)?;
    }

    Ok(deleted)
  }

  /// Drop the given tiers. They are recreated lazily on the next write.
  pub fn purge(&self, tiers: &[Tier]) -> Result<Vec<String>> {
    let mut purged = Vec::new();
    for tier in tiers {
      let name = self.store(*tier);
      if self.storage.delete_store(&name)? {
        purged.push(name);
      }
    }
    info!(stores = ?purged, "purged cache tiers");
    Ok(purged)
  }

  pub fn cache_status(&self, url: &str) -> Result<CacheStatus> {
    let api = self.store(Tier::Api);

    if let Some(shadow) = self.storage.latest_shadow(&api, "GET", url)? {
      let cache_date = parse_shadow_url(&shadow.url)
        .map(|(_, at)| at)
        .unwrap_or(shadow.inserted_at);
      return Ok(CacheStatus {
        url: url.to_string(),
        is_from_cache: true,
        cache_date: Some(cache_date),
      });
    }

    for tier in [Tier::Api, Tier::Static, Tier::Offline] {
      if let Some(entry) = self.storage.get(&self.store(tier), "GET", url)? {
        return Ok(CacheStatus {
          url: url.to_string(),
          is_from_cache: true,
          cache_date: Some(entry.inserted_at),
        });
      }
    }

    Ok(CacheStatus {
      url: url.to_string(),
      is_from_cache: false,
      cache_date: None,
    })
  }

  /// Answer one intercepted request.
  pub async fn handle_fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
    let class = self.classifier.classify(request);
    debug!(method = %request.method, url = %request.url, ?class, "intercepted fetch");

    match class {
      ResourceClass::StaticAsset => self.cache_first(request).await,
      ResourceClass::Navigation => self.navigate(request).await,
      ResourceClass::ApiRead => self.network_first(request).await,
      ResourceClass::Mutation => self.mutate(request).await,
      ResourceClass::Passthrough => self.network.fetch(request).await,
    }
  }

  /// Read failures are treated as misses.
  fn lookup(&self, store: &str, method: &str, url: &str) -> Option<CacheEntry> {
    match self.storage.get(store, method, url) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(store = %store, url = %url, error = %e, "cache read failed");
        None
      }
    }
  }

  fn populate(&self, tier: Tier, request: &FetchRequest, response: &FetchResponse) {
    if let Err(e) = self
      .storage
      .put(&self.store(tier), &request.method, &request.url, response)
    {
      warn!(url = %request.url, error = %e, "failed to populate cache");
    }
  }

  async fn cache_first(&self, request: &FetchRequest) -> Result<FetchResponse> {
    if let Some(entry) = self.lookup(&self.store(Tier::Static), &request.method, &request.url) {
      debug!(url = %request.url, "static cache hit");
      return Ok(entry.to_response());
    }

    let response = self.network.fetch(request).await?;
    if response.is_success() {
      self.populate(Tier::Static, request, &response);
    }
    Ok(response)
  }

  async fn navigate(&self, request: &FetchRequest) -> Result<FetchResponse> {
    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.populate(Tier::Static, request, &response);
        }
        Ok(response)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "navigation failed, falling back to cache");

        if let Some(entry) = self.lookup(&self.store(Tier::Static), &request.method, &request.url) {
          return Ok(entry.to_response());
        }
        if let Some(entry) = self.lookup(&self.store(Tier::Offline), "GET", &self.settings.offline_page)
        {
          return Ok(entry.to_response());
        }
        Ok(FetchResponse::html(503, OFFLINE_HTML))
      }
    }
  }

  async fn network_first(&self, request: &FetchRequest) -> Result<FetchResponse> {
    let store = self.store(Tier::Api);

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          if let Err(e) = self.storage.put_with_shadow(
            &store,
            &request.method,
            &request.url,
            &response,
            Utc::now(),
          ) {
            warn!(url = %request.url, error = %e, "failed to cache api response");
          }
        }
        Ok(response)
      }
      Err(e) => match self.lookup(&store, &request.method, &request.url) {
        Some(entry) => {
          debug!(url = %request.url, error = %e, "serving api response from cache");
          Ok(entry.to_response().with_header(SERVED_FROM_HEADER, "cache"))
        }
        None => {
          debug!(url = %request.url, error = %e, "offline with no cached api response");
          Ok(offline_payload())
        }
      },
    }
  }

  async fn mutate(&self, request: &FetchRequest) -> Result<FetchResponse> {
    if self.connectivity.is_online() {
      return self.network.fetch(request).await;
    }

    match self.network.fetch(request).await {
      Ok(response) => Ok(response),
      Err(e) => {
        debug!(method = %request.method, url = %request.url, error = %e, "diverting mutation to offline queue");
        let queued = self.queue.enqueue(request)?;
        Ok(queued_response(&queued.id))
      }
    }
  }
}
