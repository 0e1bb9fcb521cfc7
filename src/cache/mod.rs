//! Multi-tier interception cache.
//!
//! This module provides the worker-side fetch interceptor that:
//! - Serves static assets cache-first and navigations with an offline fallback page
//! - Serves API reads network-first, falling back to the api store when offline
//! - Diverts mutations into the offline queue while disconnected
//! - Scopes every store to a deployed version so activation drops stale tiers

mod classify;
mod fallback;
mod manager;
mod store;
mod tiers;

pub use classify::{Classifier, ResourceClass};
pub use fallback::{offline_payload, queued_response, OFFLINE_HTML};
pub use manager::{CacheSettings, CacheStatus, CacheTierManager, InstallReport};
pub use store::{parse_shadow_url, shadow_url, CacheEntry, CacheStorage, SqliteCacheStorage};
pub use tiers::{CacheTiers, Tier};
