//! SQLite helpers shared by the cache store, the offline queue and the version store.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Key/value table every database carries for small bits of bookkeeping.
pub const META_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Open or create a database at `path` and apply `schema`.
pub fn open(path: &Path, schema: &str) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  // Several handles (one per tab/context) may share a file
  conn
    .busy_timeout(std::time::Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;

  run_migrations(&conn, schema)?;
  Ok(conn)
}

/// Open a private in-memory database with `schema` applied.
pub fn open_in_memory(schema: &str) -> Result<Connection> {
  let conn =
    Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
  run_migrations(&conn, schema)?;
  Ok(conn)
}

fn run_migrations(conn: &Connection, schema: &str) -> Result<()> {
  conn
    .execute_batch(META_SCHEMA)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
  conn
    .execute_batch(schema)
    .map_err(|e| eyre!("Failed to run migrations: {}", e))?;
  Ok(())
}

/// Default directory for all databases.
pub fn default_data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("weatherproof"))
}

/// Resolve an optional configured path against the default data directory.
pub fn resolve_path(configured: Option<&Path>, file_name: &str) -> Result<PathBuf> {
  match configured {
    Some(path) => Ok(path.to_path_buf()),
    None => Ok(default_data_dir()?.join(file_name)),
  }
}

pub fn lock(conn: &Mutex<Connection>) -> Result<MutexGuard<'_, Connection>> {
  conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
}

pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
  conn
    .query_row(
      "SELECT value FROM meta WHERE key = ?",
      params![key],
      |row| row.get(0),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read meta {}: {}", key, e))
}

pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
  conn
    .execute(
      "INSERT INTO meta (key, value) VALUES (?, ?)
       ON CONFLICT(key) DO UPDATE SET value = excluded.value",
      params![key, value],
    )
    .map_err(|e| eyre!("Failed to write meta {}: {}", key, e))?;
  Ok(())
}

/// Timestamps are stored as unix milliseconds so they sort numerically.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

pub fn from_millis(millis: i64) -> Result<DateTime<Utc>> {
  DateTime::from_timestamp_millis(millis).ok_or_else(|| eyre!("Invalid timestamp {}", millis))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_meta_roundtrip_overwrites() {
    let conn = open_in_memory("").unwrap();
    assert_eq!(get_meta(&conn, "last_sync").unwrap(), None);

    set_meta(&conn, "last_sync", "1").unwrap();
    set_meta(&conn, "last_sync", "2").unwrap();
    assert_eq!(get_meta(&conn, "last_sync").unwrap().as_deref(), Some("2"));
  }

  #[test]
  fn test_open_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("queue.db");
    open(&path, "").unwrap();
    assert!(path.exists());
  }
}
