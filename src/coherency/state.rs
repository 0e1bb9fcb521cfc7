//! Server-owned cache epoch and the admin actions that move it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;
use tracing::info;

use crate::db;

const VERSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    current_version INTEGER NOT NULL,
    last_invalidation INTEGER,
    force_update INTEGER NOT NULL
);

INSERT OR IGNORE INTO cache_version (id, current_version, last_invalidation, force_update)
VALUES (1, 1, NULL, 0);

CREATE TABLE IF NOT EXISTS cache_invalidations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    version INTEGER NOT NULL,
    action TEXT NOT NULL,
    reason TEXT,
    at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_invalidations_at ON cache_invalidations(at);
"#;

/// The cache epoch every client polls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheVersionState {
  pub current_version: u64,
  pub last_invalidation: Option<DateTime<Utc>>,
  pub force_update: bool,
}

impl Default for CacheVersionState {
  fn default() -> Self {
    Self {
      current_version: 1,
      last_invalidation: None,
      force_update: false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvalidationAction {
  /// Bump the version and make every client purge all tiers and reload
  ClearAll,
  /// Bump the version; clients drop only their api tier
  SoftClear,
  /// Clear the force flag without touching the version
  ResetForce,
}

impl InvalidationAction {
  pub const ALL: [InvalidationAction; 3] = [
    InvalidationAction::ClearAll,
    InvalidationAction::SoftClear,
    InvalidationAction::ResetForce,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      InvalidationAction::ClearAll => "clear-all",
      InvalidationAction::SoftClear => "soft-clear",
      InvalidationAction::ResetForce => "reset-force",
    }
  }

  /// Apply this action to a state.
  pub fn apply(&self, state: &CacheVersionState, now: DateTime<Utc>) -> CacheVersionState {
    match self {
      InvalidationAction::ClearAll => CacheVersionState {
        current_version: state.current_version + 1,
        last_invalidation: Some(now),
        force_update: true,
      },
      InvalidationAction::SoftClear => CacheVersionState {
        current_version: state.current_version + 1,
        last_invalidation: Some(now),
        force_update: state.force_update,
      },
      InvalidationAction::ResetForce => CacheVersionState {
        force_update: false,
        ..state.clone()
      },
    }
  }
}

impl fmt::Display for InvalidationAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for InvalidationAction {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    Self::ALL
      .into_iter()
      .find(|action| action.as_str() == s)
      .ok_or_else(|| eyre!("Unknown action: {}", s))
  }
}

/// One row of the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationRecord {
  pub version: u64,
  pub action: InvalidationAction,
  pub reason: Option<String>,
  pub at: DateTime<Utc>,
}

/// Anything clients can read the current epoch from.
#[async_trait]
pub trait VersionSource: Send + Sync {
  async fn status(&self) -> Result<CacheVersionState>;
}

/// SQLite-backed home of the epoch.
pub struct VersionStore {
  conn: Mutex<Connection>,
}

impl VersionStore {
  pub fn open(path: &Path) -> Result<Self> {
    let conn = db::open(path, VERSION_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn in_memory() -> Result<Self> {
    let conn = db::open_in_memory(VERSION_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  pub fn load(&self) -> Result<CacheVersionState> {
    let conn = db::lock(&self.conn)?;
    read_state(&conn)
  }

  /// Apply an admin action and record it, atomically.
  pub fn apply(
    &self,
    action: InvalidationAction,
    reason: Option<&str>,
  ) -> Result<CacheVersionState> {
    self.apply_at(action, reason, Utc::now())
  }

  pub fn apply_at(
    &self,
    action: InvalidationAction,
    reason: Option<&str>,
    now: DateTime<Utc>,
  ) -> Result<CacheVersionState> {
    let mut conn = db::lock(&self.conn)?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let current = read_state(&tx)?;
    let next = action.apply(&current, now);
    let version = i64::try_from(next.current_version)
      .map_err(|_| eyre!("Cache version {} out of range", next.current_version))?;

    tx.execute(
      "UPDATE cache_version
       SET current_version = ?, last_invalidation = ?, force_update = ?
       WHERE id = 1",
      params![
        version,
        next.last_invalidation.map(db::to_millis),
        next.force_update
      ],
    )
    .map_err(|e| eyre!("Failed to update cache version: {}", e))?;

    tx.execute(
      "INSERT INTO cache_invalidations (version, action, reason, at) VALUES (?, ?, ?, ?)",
      params![version, action.as_str(), reason, db::to_millis(now)],
    )
    .map_err(|e| eyre!("Failed to record invalidation: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit invalidation: {}", e))?;

    info!(
      action = %action,
      version = next.current_version,
      force_update = next.force_update,
      reason = reason.unwrap_or_default(),
      "cache version changed"
    );
    Ok(next)
  }

  /// Most recent invalidations first.
  pub fn history(&self, limit: usize) -> Result<Vec<InvalidationRecord>> {
    let conn = db::lock(&self.conn)?;
    let mut stmt = conn
      .prepare(
        "SELECT version, action, reason, at FROM cache_invalidations
         ORDER BY at DESC, id DESC LIMIT ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![limit as i64], |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Option<String>>(2)?,
          row.get::<_, i64>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query history: {}", e))?;

    let mut records = Vec::new();
    for row in rows {
      let (version, action, reason, at) = row.map_err(|e| eyre!("Failed to read row: {}", e))?;
      records.push(InvalidationRecord {
        version: version as u64,
        action: action.parse()?,
        reason,
        at: db::from_millis(at)?,
      });
    }
    Ok(records)
  }
}

#[async_trait]
impl VersionSource for VersionStore {
  async fn status(&self) -> Result<CacheVersionState> {
    self.load()
  }
}

fn read_state(conn: &Connection) -> Result<CacheVersionState> {
  let row = conn
    .query_row(
      "SELECT current_version, last_invalidation, force_update FROM cache_version WHERE id = 1",
      [],
      |row| {
        Ok((
          row.get::<_, i64>(0)?,
          row.get::<_, Option<i64>>(1)?,
          row.get::<_, bool>(2)?,
        ))
      },
    )
    .optional()
    .map_err(|e| eyre!("Failed to read cache version: {}", e))?;

  match row {
    Some((version, last_invalidation, force_update)) => Ok(CacheVersionState {
      current_version: version as u64,
      last_invalidation: last_invalidation.map(db::from_millis).transpose()?,
      force_update,
    }),
    None => Ok(CacheVersionState::default()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_fresh_store_starts_at_version_one() {
    let store = VersionStore::in_memory().unwrap();
    assert_eq!(store.load().unwrap(), CacheVersionState::default());
    assert!(store.history(10).unwrap().is_empty());
  }

  #[test]
  fn test_clear_all_bumps_version_and_forces_update() {
    let store = VersionStore::in_memory().unwrap();
    let now = Utc::now();

    let state = store
      .apply_at(InvalidationAction::ClearAll, Some("bad deploy"), now)
      .unwrap();
    assert_eq!(state.current_version, 2);
    assert!(state.force_update);
    assert_eq!(
      state.last_invalidation.map(|at| at.timestamp_millis()),
      Some(now.timestamp_millis())
    );
    assert_eq!(store.load().unwrap(), state);
  }

  #[test]
  fn test_reset_force_keeps_version() {
    let store = VersionStore::in_memory().unwrap();
    store.apply(InvalidationAction::ClearAll, None).unwrap();

    let state = store.apply(InvalidationAction::ResetForce, None).unwrap();
    assert_eq!(state.current_version, 2);
    assert!(!state.force_update);
  }

  #[test]
  fn test_soft_clear_preserves_force_flag() {
    let store = VersionStore::in_memory().unwrap();
    store.apply(InvalidationAction::ClearAll, None).unwrap();

    let state = store.apply(InvalidationAction::SoftClear, None).unwrap();
    assert_eq!(state.current_version, 3);
    assert!(state.force_update);
  }

  #[test]
  fn test_history_is_newest_first_and_limited() {
    let store = VersionStore::in_memory().unwrap();
    let start = Utc::now();
    store
      .apply_at(InvalidationAction::SoftClear, Some("one"), start)
      .unwrap();
    store
      .apply_at(InvalidationAction::ClearAll, Some("two"), start + Duration::seconds(1))
      .unwrap();
    store
      .apply_at(InvalidationAction::ResetForce, None, start + Duration::seconds(2))
      .unwrap();

    let history = store.history(2).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].action, InvalidationAction::ResetForce);
    assert_eq!(history[0].version, 3);
    assert_eq!(history[1].reason.as_deref(), Some("two"));
  }

  #[test]
  fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("control.db");

    VersionStore::open(&path)
      .unwrap()
      .apply(InvalidationAction::SoftClear, None)
      .unwrap();

    let reopened = VersionStore::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap().current_version, 2);
  }

  #[test]
  fn test_action_names() {
    assert_eq!(
      "soft-clear".parse::<InvalidationAction>().unwrap(),
      InvalidationAction::SoftClear
    );
    assert!("nuke".parse::<InvalidationAction>().is_err());
    assert_eq!(
      serde_json::to_value(InvalidationAction::ResetForce).unwrap(),
      "reset-force"
    );
  }
}
