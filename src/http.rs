//! Plain request/response values passed between the guard, the worker and the network.
//!
//! The reqwest transport, the cache store and the offline queue all convert to
//! and from them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Header added to API responses that were served from the api store.
pub const SERVED_FROM_HEADER: &str = "x-served-from";

/// Header carrying the offline queue id on a queued-acceptance response.
pub const QUEUED_ID_HEADER: &str = "x-queued-request-id";

pub const CONTENT_TYPE: &str = "content-type";

/// An intercepted outbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchRequest {
  /// Upper-case HTTP method
  pub method: String,
  /// Absolute URL
  pub url: String,
  /// Header names are stored lower-case
  pub headers: BTreeMap<String, String>,
  pub body: Option<String>,
  /// True for top-level page navigations
  #[serde(default)]
  pub navigation: bool,
}

impl FetchRequest {
  pub fn new(method: &str, url: impl Into<String>) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
      navigation: false,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new("GET", url)
  }

  /// A top-level page navigation.
  pub fn navigate(url: impl Into<String>) -> Self {
    Self {
      navigation: true,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn with_body(mut self, body: impl Into<String>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// JSON body with the matching content type.
  pub fn with_json(self, body: &Value) -> Self {
    self
      .with_header(CONTENT_TYPE, "application/json")
      .with_body(body.to_string())
  }

  pub fn is_get(&self) -> bool {
    self.method == "GET"
  }

  /// Whether this request changes server state and must never be answered from cache.
  pub fn is_mutation(&self) -> bool {
    !matches!(self.method.as_str(), "GET" | "HEAD" | "OPTIONS")
  }

  /// Path component of the URL, or the raw URL if it does not parse.
  pub fn path(&self) -> String {
    match url::Url::parse(&self.url) {
      Ok(parsed) => parsed.path().to_string(),
      Err(_) => self
        .url
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .to_string(),
    }
  }
}

/// A response as seen by the page, whether it came from the network or a cache tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl FetchResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status, value.to_string()).with_header(CONTENT_TYPE, "application/json")
  }

  pub fn html(status: u16, document: &str) -> Self {
    Self::new(status, document).with_header(CONTENT_TYPE, "text/html; charset=utf-8")
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.into());
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .get(&name.to_ascii_lowercase())
      .map(String::as_str)
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn is_server_error(&self) -> bool {
    self.status >= 500
  }

  /// True if this response was answered from the api store instead of the network.
  pub fn is_from_cache(&self) -> bool {
    self.header(SERVED_FROM_HEADER) == Some("cache")
  }

  /// The offline queue id when this is a queued acceptance ("accepted but not yet applied").
  pub fn queued_request_id(&self) -> Option<&str> {
    if self.status == 202 {
      self.header(QUEUED_ID_HEADER)
    } else {
      None
    }
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json_body(&self) -> Option<Value> {
    serde_json::from_slice(&self.body).ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_mutation_methods() {
    assert!(FetchRequest::new("post", "http://x/api/tasks").is_mutation());
    assert!(FetchRequest::new("DELETE", "http://x/api/tasks/1").is_mutation());
    assert!(!FetchRequest::get("http://x/api/tasks").is_mutation());
    assert!(!FetchRequest::new("HEAD", "http://x/").is_mutation());
  }

  #[test]
  fn test_path_strips_query() {
    let request = FetchRequest::get("https://admin.example.com/api/tasks?page=2");
    assert_eq!(request.path(), "/api/tasks");
  }

  #[test]
  fn test_headers_are_case_insensitive() {
    let response = FetchResponse::json(200, &json!({"ok": true})).with_header("X-Served-From", "cache");
    assert!(response.is_from_cache());
    assert_eq!(response.header("Content-Type"), Some("application/json"));
  }

  #[test]
  fn test_queued_request_id_requires_202() {
    let queued = FetchResponse::new(202, "").with_header(QUEUED_ID_HEADER, "abc");
    assert_eq!(queued.queued_request_id(), Some("abc"));

    let ok = FetchResponse::new(200, "").with_header(QUEUED_ID_HEADER, "abc");
    assert_eq!(ok.queued_request_id(), None);
  }
}
