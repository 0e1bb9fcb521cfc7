//! Control-plane HTTP API for the cache epoch.

use axum::{
  extract::{rejection::JsonRejection, Query, State},
  http::{header::AUTHORIZATION, HeaderMap, StatusCode},
  response::{IntoResponse, Response},
  routing::get,
  Json, Router,
};
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use super::state::{InvalidationAction, InvalidationRecord, VersionStore};

pub const STATUS_PATH: &str = "/api/cache-control";
pub const HISTORY_PATH: &str = "/api/cache-control/history";

const DEFAULT_HISTORY_LIMIT: usize = 20;
const MAX_HISTORY_LIMIT: usize = 500;

#[derive(Debug, Error)]
pub enum ApiError {
  #[error("Unauthorized")]
  Unauthorized,

  #[error("{0}")]
  BadRequest(String),

  #[error("Internal error: {0}")]
  Internal(String),
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = match &self {
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": self.to_string() }))).into_response()
  }
}

impl From<color_eyre::Report> for ApiError {
  fn from(e: color_eyre::Report) -> Self {
    ApiError::Internal(e.to_string())
  }
}

/// Shared state behind the router.
pub struct ControlPlane {
  store: VersionStore,
  /// SHA-256 of the operator token; None disables every authenticated route
  token_digest: Option<[u8; 32]>,
}

impl ControlPlane {
  pub fn new(store: VersionStore, operator_token: Option<&str>) -> Self {
    if operator_token.is_none() {
      warn!("no operator token configured; cache invalidation is disabled");
    }
    Self {
      store,
      token_digest: operator_token.map(digest),
    }
  }

  pub fn store(&self) -> &VersionStore {
    &self.store
  }

  fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = self.token_digest.ok_or(ApiError::Unauthorized)?;
    let presented = headers
      .get(AUTHORIZATION)
      .and_then(|value| value.to_str().ok())
      .and_then(|value| value.strip_prefix("Bearer "))
      .ok_or(ApiError::Unauthorized)?;

    if digest(presented.trim()) == expected {
      Ok(())
    } else {
      Err(ApiError::Unauthorized)
    }
  }
}

fn digest(token: &str) -> [u8; 32] {
  let mut out = [0u8; 32];
  out.copy_from_slice(&Sha256::digest(token.as_bytes()));
  out
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
  pub current_version: u64,
  pub last_invalidation: Option<DateTime<Utc>>,
  pub force_update: bool,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InvalidateRequest {
  pub action: String,
  #[serde(default)]
  pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateResponse {
  pub success: bool,
  pub action: InvalidationAction,
  pub new_version: u64,
  pub force_update: bool,
  pub last_invalidation: Option<DateTime<Utc>>,
  pub reason: Option<String>,
  pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
  pub limit: Option<usize>,
}

pub fn router(plane: Arc<ControlPlane>) -> Router {
  Router::new()
    .route(STATUS_PATH, get(status).post(invalidate))
    .route(HISTORY_PATH, get(history))
    .route("/health", get(health))
    .with_state(plane)
}

/// Serve the control plane until Ctrl-C.
pub async fn serve(bind: SocketAddr, plane: Arc<ControlPlane>) -> Result<()> {
  let listener = tokio::net::TcpListener::bind(bind)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", bind, e))?;
  info!(addr = %bind, "cache control plane listening");

  axum::serve(listener, router(plane))
    .with_graceful_shutdown(async {
      let _ = tokio::signal::ctrl_c().await;
    })
    .await
    .map_err(|e| eyre!("Control plane server failed: {}", e))
}

async fn health() -> impl IntoResponse {
  "OK"
}

/// GET /api/cache-control
async fn status(State(plane): State<Arc<ControlPlane>>) -> Result<Json<StatusResponse>, ApiError> {
  let state = plane.store.load()?;
  Ok(Json(StatusResponse {
    current_version: state.current_version,
    last_invalidation: state.last_invalidation,
    force_update: state.force_update,
    timestamp: Utc::now(),
  }))
}

/// POST /api/cache-control
async fn invalidate(
  State(plane): State<Arc<ControlPlane>>,
  headers: HeaderMap,
  body: Result<Json<InvalidateRequest>, JsonRejection>,
) -> Result<Json<InvalidateResponse>, ApiError> {
  plane.authorize(&headers)?;

  let Json(request) = body.map_err(|e| ApiError::BadRequest(e.body_text()))?;
  let action: InvalidationAction = request
    .action
    .parse()
    .map_err(|_| ApiError::BadRequest(format!("Unknown action: {}", request.action)))?;

  let state = plane.store.apply(action, request.reason.as_deref())?;
  Ok(Json(InvalidateResponse {
    success: true,
    action,
    new_version: state.current_version,
    force_update: state.force_update,
    last_invalidation: state.last_invalidation,
    reason: request.reason,
    timestamp: Utc::now(),
  }))
}

/// GET /api/cache-control/history
async fn history(
  State(plane): State<Arc<ControlPlane>>,
  headers: HeaderMap,
  Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<InvalidationRecord>>, ApiError> {
  plane.authorize(&headers)?;
  let limit = query
    .limit
    .unwrap_or(DEFAULT_HISTORY_LIMIT)
    .clamp(1, MAX_HISTORY_LIMIT);
  Ok(Json(plane.store.history(limit)?))
}
