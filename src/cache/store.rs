//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use crate::db;
use crate::http::FetchResponse;

/// Marker between a URL and its timestamp in a shadow key.
const SHADOW_MARKER: &str = "#cached-at=";

/// A single cached response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub store: String,
  pub method: String,
  pub url: String,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
  pub inserted_at: DateTime<Utc>,
}

impl CacheEntry {
  /// Rebuild the response this entry was captured from.
  pub fn to_response(&self) -> FetchResponse {
    FetchResponse {
      status: self.status,
      headers: self.headers.clone(),
      body: self.body.clone(),
    }
  }
}

/// Key of the timestamp-tagged duplicate of an api entry.
pub fn shadow_url(url: &str, at: DateTime<Utc>) -> String {
  format!("{}{}{}", url, SHADOW_MARKER, at.timestamp_millis())
}

/// Recover the timestamp encoded in a shadow key.
pub fn parse_shadow_url(shadow: &str) -> Option<(&str, DateTime<Utc>)> {
  let (url, millis) = shadow.rsplit_once(SHADOW_MARKER)?;
  let at = DateTime::from_timestamp_millis(millis.parse().ok()?)?;
  Some((url, at))
}

/// Trait for cache storage backends.
///
/// Each named store behaves like a `CacheStorage` bucket in a browser: it is
/// created on first use and deleted wholesale.
pub trait CacheStorage: Send + Sync {
  /// Create the store if it does not exist yet.
  fn open_store(&self, store: &str) -> Result<()>;

  /// Names of every existing store.
  fn store_names(&self) -> Result<Vec<String>>;

  /// Delete a store and all of its entries. Returns false if it did not exist.
  fn delete_store(&self, store: &str) -> Result<bool>;

  /// Insert or replace the response for (method, url).
  fn put(&self, store: &str, method: &str, url: &str, response: &FetchResponse) -> Result<()>;

  fn get(&self, store: &str, method: &str, url: &str) -> Result<Option<CacheEntry>>;

  /// Store a response together with its shadow copy, replacing any older shadow.
  fn put_with_shadow(
    &self,
    store: &str,
    method: &str,
    url: &str,
    response: &FetchResponse,
    at: DateTime<Utc>,
  ) -> Result<()>;

  /// Most recent shadow entry for `url`, if any.
  fn latest_shadow(&self, store: &str, method: &str, url: &str) -> Result<Option<CacheEntry>>;

  fn entry_count(&self, store: &str) -> Result<usize>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteCacheStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_stores (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cache_entries (
    store TEXT NOT NULL,
    method TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    inserted_at INTEGER NOT NULL,
    PRIMARY KEY (store, method, url)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_store ON cache_entries(store);
"#;

impl SqliteCacheStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn in_memory() -> Result<Self> {
    let conn = db::open_in_memory(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

fn ensure_store(conn: &Connection, store: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO cache_stores (name, created_at) VALUES (?, ?)",
      params![store, db::to_millis(Utc::now())],
    )
    .map_err(|e| eyre!("Failed to create cache store {}: {}", store, e))?;
  Ok(())
}

fn insert_entry(
  conn: &Connection,
  store: &str,
  method: &str,
  url: &str,
  response: &FetchResponse,
  at: DateTime<Utc>,
) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries (store, method, url, status, headers, body, inserted_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        store,
        method,
        url,
        response.status,
        headers,
        response.body,
        db::to_millis(at)
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry {}: {}", url, e))?;
  Ok(())
}

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, u16, String, Vec<u8>, i64)> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
  ))
}

fn into_entry(raw: (String, String, String, u16, String, Vec<u8>, i64)) -> Result<CacheEntry> {
  let (store, method, url, status, headers, body, inserted_at) = raw;
  let headers: BTreeMap<String, String> =
    serde_json::from_str(&headers).map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

  Ok(CacheEntry {
    store,
    method,
    url,
    status,
    headers,
    body,
    inserted_at: db::from_millis(inserted_at)?,
  })
}

impl CacheStorage for SqliteCacheStorage {
  fn open_store(&self, store: &str) -> Result<()> {
    let conn = db::lock(&self.conn)?;
    ensure_store(&conn, store)
  }

  fn store_names(&self) -> Result<Vec<String>> {
    let conn = db::lock(&self.conn)?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_stores ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to list cache stores: {}", e))?;

    Ok(names)
  }

  fn delete_store(&self, store: &str) -> Result<bool> {
    let mut conn = db::lock(&self.conn)?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM cache_entries WHERE store = ?", params![store])
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", store, e))?;
    let removed = tx
      .execute("DELETE FROM cache_stores WHERE name = ?", params![store])
      .map_err(|e| eyre!("Failed to delete cache store {}: {}", store, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn put(&self, store: &str, method: &str, url: &str, response: &FetchResponse) -> Result<()> {
    let conn = db::lock(&self.conn)?;
    ensure_store(&conn, store)?;
    insert_entry(&conn, store, method, url, response, Utc::now())
  }

  fn get(&self, store: &str, method: &str, url: &str) -> Result<Option<CacheEntry>> {
    let conn = db::lock(&self.conn)?;
    let raw = conn
      .query_row(
        "SELECT store, method, url, status, headers, body, inserted_at FROM cache_entries
         WHERE store = ? AND method = ? AND url = ?",
        params![store, method, url],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", url, e))?;

    raw.map(into_entry).transpose()
  }

  fn put_with_shadow(
    &self,
    store: &str,
    method: &str,
    url: &str,
    response: &FetchResponse,
    at: DateTime<Utc>,
  ) -> Result<()> {
    let mut conn = db::lock(&self.conn)?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_store(&tx, store)?;
    insert_entry(&tx, store, method, url, response, at)?;

    // Only the newest shadow is worth keeping
    let prefix = format!("{}{}", url, SHADOW_MARKER);
    tx.execute(
      "DELETE FROM cache_entries
       WHERE store = ?1 AND method = ?2 AND substr(url, 1, length(?3)) = ?3",
      params![store, method, prefix],
    )
    .map_err(|e| eyre!("Failed to drop old shadow entries for {}: {}", url, e))?;
    insert_entry(&tx, store, method, &shadow_url(url, at), response, at)?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn latest_shadow(&self, store: &str, method: &str, url: &str) -> Result<Option<CacheEntry>> {
    let conn = db::lock(&self.conn)?;
    let prefix = format!("{}{}", url, SHADOW_MARKER);
    let raw = conn
      .query_row(
        "SELECT store, method, url, status, headers, body, inserted_at FROM cache_entries
         WHERE store = ?1 AND method = ?2 AND substr(url, 1, length(?3)) = ?3
         ORDER BY inserted_at DESC LIMIT 1",
        params![store, method, prefix],
        read_entry,
      )
      .optional()
      .map_err(|e| eyre!("Failed to read shadow entry for {}: {}", url, e))?;

    raw.map(into_entry).transpose()
  }

  fn entry_count(&self, store: &str) -> Result<usize> {
    let conn = db::lock(&self.conn)?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM cache_entries WHERE store = ?",
        params![store],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries of {}: {}", store, e))?;

    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_put_and_get() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    let response = FetchResponse::new(200, "hello").with_header("content-type", "text/plain");

    storage
      .put("static-v1", "GET", "http://x/app.js", &response)
      .unwrap();

    let entry = storage
      .get("static-v1", "GET", "http://x/app.js")
      .unwrap()
      .unwrap();
    assert_eq!(entry.to_response(), response);
    assert_eq!(storage.store_names().unwrap(), vec!["static-v1".to_string()]);
    assert!(storage.get("static-v1", "POST", "http://x/app.js").unwrap().is_none());
  }

  #[test]
  fn test_shadow_entry_replaced_on_refresh() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    let first = Utc::now() - Duration::seconds(10);
    let second = Utc::now();

    storage
      .put_with_shadow("api-v1", "GET", "http://x/api/tasks", &FetchResponse::new(200, "a"), first)
      .unwrap();
    storage
      .put_with_shadow("api-v1", "GET", "http://x/api/tasks", &FetchResponse::new(200, "b"), second)
      .unwrap();

    // raw entry + exactly one shadow
    assert_eq!(storage.entry_count("api-v1").unwrap(), 2);

    let shadow = storage
      .latest_shadow("api-v1", "GET", "http://x/api/tasks")
      .unwrap()
      .unwrap();
    assert_eq!(shadow.body, b"b");
    let (url, at) = parse_shadow_url(&shadow.url).unwrap();
    assert_eq!(url, "http://x/api/tasks");
    assert_eq!(at.timestamp_millis(), second.timestamp_millis());
  }

  #[test]
  fn test_shadow_prefix_does_not_match_other_urls() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    let now = Utc::now();
    storage
      .put_with_shadow("api-v1", "GET", "http://x/api/task", &FetchResponse::new(200, "one"), now)
      .unwrap();
    storage
      .put_with_shadow("api-v1", "GET", "http://x/api/tasks", &FetchResponse::new(200, "many"), now)
      .unwrap();

    assert_eq!(storage.entry_count("api-v1").unwrap(), 4);
  }

  #[test]
  fn test_delete_store_removes_entries() {
    let storage = SqliteCacheStorage::in_memory().unwrap();
    storage
      .put("api-v1", "GET", "http://x/api/tasks", &FetchResponse::new(200, "[]"))
      .unwrap();
    storage.open_store("static-v1").unwrap();

    assert!(storage.delete_store("api-v1").unwrap());
    assert!(!storage.delete_store("api-v1").unwrap());
    assert_eq!(storage.entry_count("api-v1").unwrap(), 0);
    assert_eq!(storage.store_names().unwrap(), vec!["static-v1".to_string()]);
  }
}
