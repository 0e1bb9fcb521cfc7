//! Messages exchanged between pages and the worker, tagged by `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Background-sync tags that drain the offline queue.
pub const SYNC_TAGS: [&str; 2] = ["background-sync", "offline-queue-sync"];

/// Requests a page can send to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageMessage {
  ClearApiCache,
  ClearAllCache,
  ProcessOfflineQueue,
  GetCacheStatus { url: String },
}

impl PageMessage {
  pub fn kind(&self) -> &'static str {
    match self {
      PageMessage::ClearApiCache => "CLEAR_API_CACHE",
      PageMessage::ClearAllCache => "CLEAR_ALL_CACHE",
      PageMessage::ProcessOfflineQueue => "PROCESS_OFFLINE_QUEUE",
      PageMessage::GetCacheStatus { .. } => "GET_CACHE_STATUS",
    }
  }
}

/// Replies and broadcasts from the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  #[serde(rename_all = "camelCase")]
  CacheStatus {
    is_from_cache: bool,
    cache_date: Option<DateTime<Utc>>,
    last_sync: Option<DateTime<Utc>>,
    url: String,
  },
  CacheCleared {
    stores: Vec<String>,
  },
  QueueProcessed {
    replayed: usize,
    failed: usize,
    remaining: usize,
    skipped: bool,
  },
  /// Broadcast to every page once per replayed entry
  #[serde(rename_all = "camelCase")]
  SyncComplete {
    request_id: String,
    success: bool,
  },
  Error {
    message: String,
  },
}

/// A message plus the correlation id its reply must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
  pub id: u64,
  #[serde(flatten)]
  pub payload: T,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_page_message_wire_format() {
    let envelope = Envelope {
      id: 7,
      payload: PageMessage::GetCacheStatus {
        url: "/api/tasks".to_string(),
      },
    };
    assert_eq!(
      serde_json::to_value(&envelope).unwrap(),
      json!({"id": 7, "type": "GET_CACHE_STATUS", "url": "/api/tasks"})
    );

    let parsed: PageMessage = serde_json::from_value(json!({"type": "CLEAR_API_CACHE"})).unwrap();
    assert_eq!(parsed, PageMessage::ClearApiCache);
  }

  #[test]
  fn test_worker_message_wire_format() {
    let message = WorkerMessage::SyncComplete {
      request_id: "abc".to_string(),
      success: true,
    };
    assert_eq!(
      serde_json::to_value(&message).unwrap(),
      json!({"type": "SYNC_COMPLETE", "requestId": "abc", "success": true})
    );

    let status = WorkerMessage::CacheStatus {
      is_from_cache: false,
      cache_date: None,
      last_sync: None,
      url: "/api/tasks".to_string(),
    };
    let value = serde_json::to_value(&status).unwrap();
    assert_eq!(value["type"], "CACHE_STATUS");
    assert_eq!(value["isFromCache"], false);
  }
}
