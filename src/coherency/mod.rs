//! Cache coherency across independent clients.
//!
//! The server holds a monotonically increasing cache version plus a
//! force-update flag. Clients poll it and purge their own caches when it moves,
//! so every instance converges within one poll interval without a push channel.

mod client;
mod server;
mod state;

pub use client::{
  CoherencyAction, CoherencyMonitor, CoherencyTracker, ControlPlaneClient, ReloadRequest,
  DEFAULT_POLL_INTERVAL,
};
pub use server::{
  router, serve, ApiError, ControlPlane, InvalidateRequest, InvalidateResponse, StatusResponse,
  HISTORY_PATH, STATUS_PATH,
};
pub use state::{
  CacheVersionState, InvalidationAction, InvalidationRecord, VersionSource, VersionStore,
};
