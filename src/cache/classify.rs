//! Maps an intercepted request to the strategy that handles it.

use crate::http::FetchRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
  /// Top-level page load: network, then cache, then the offline page
  Navigation,
  /// Cache-first
  StaticAsset,
  /// Network-first with api-store fallback
  ApiRead,
  /// Passed through online, queued offline
  Mutation,
  /// Not ours to cache
  Passthrough,
}

#[derive(Debug, Clone)]
pub struct Classifier {
  api_prefix: String,
  static_extensions: Vec<String>,
  precached_paths: Vec<String>,
}

impl Classifier {
  pub fn new(api_prefix: &str, static_extensions: &[String], precached_paths: &[String]) -> Self {
    Self {
      api_prefix: api_prefix.to_string(),
      static_extensions: static_extensions
        .iter()
        .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
        .collect(),
      precached_paths: precached_paths.to_vec(),
    }
  }

  pub fn classify(&self, request: &FetchRequest) -> ResourceClass {
    if request.is_mutation() {
      return ResourceClass::Mutation;
    }
    if !request.is_get() {
      return ResourceClass::Passthrough;
    }
    if request.navigation {
      return ResourceClass::Navigation;
    }

    let path = request.path();
    if path.starts_with(&self.api_prefix) {
      return ResourceClass::ApiRead;
    }
    if self.is_static_path(&path) {
      return ResourceClass::StaticAsset;
    }

    ResourceClass::Passthrough
  }

  fn is_static_path(&self, path: &str) -> bool {
    if self.precached_paths.iter().any(|p| p == path) {
      return true;
    }

    let file = path.rsplit('/').next().unwrap_or_default();
    match file.rsplit_once('.') {
      Some((_, ext)) => {
        let ext = ext.to_ascii_lowercase();
        self.static_extensions.iter().any(|e| *e == ext)
      }
      None => false,
    }
  }
}
