//! Replay leadership shared through the queue database.
//!
//! Every context that opens the queue file competes for one lease row. The
//! holder renews it while draining; a crashed holder loses it once it expires.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::time::Duration;

use crate::db;

const LEASE_NAME: &str = "replay";

pub const LEASE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_lease (
    name TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);
"#;

/// Take or renew the lease for `owner`. Returns false if someone else holds an unexpired lease.
pub fn try_acquire(conn: &Connection, owner: &str, ttl: Duration, now: DateTime<Utc>) -> Result<bool> {
  let now_millis = db::to_millis(now);
  let expires_at = now_millis.saturating_add(ttl.as_millis() as i64);

  let changed = conn
    .execute(
      "INSERT INTO queue_lease (name, owner, expires_at) VALUES (?1, ?2, ?3)
       ON CONFLICT(name) DO UPDATE SET owner = excluded.owner, expires_at = excluded.expires_at
       WHERE queue_lease.owner = excluded.owner OR queue_lease.expires_at <= ?4",
      params![LEASE_NAME, owner, expires_at, now_millis],
    )
    .map_err(|e| eyre!("Failed to acquire replay lease: {}", e))?;

  Ok(changed == 1)
}

/// Drop the lease if `owner` still holds it.
pub fn release(conn: &Connection, owner: &str) -> Result<()> {
  conn
    .execute(
      "DELETE FROM queue_lease WHERE name = ? AND owner = ?",
      params![LEASE_NAME, owner],
    )
    .map_err(|e| eyre!("Failed to release replay lease: {}", e))?;
  Ok(())
}
