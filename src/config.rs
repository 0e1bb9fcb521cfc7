use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::{CacheSettings, CacheTiers};
use crate::db;
use crate::guard::{BreakerConfig, GuardConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the admin app, e.g. `https://admin.example.com`
  pub origin: String,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub guard: GuardSettings,
  #[serde(default)]
  pub breaker: BreakerSettings,
  #[serde(default)]
  pub coherency: CoherencyConfig,
  #[serde(default)]
  pub control_plane: ControlPlaneConfig,
  #[serde(default)]
  pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub namespace: String,
  /// Bump on every deploy; stores from other versions are dropped on activation
  pub version: String,
  pub api_prefix: String,
  pub offline_page: String,
  pub precache_required: Vec<String>,
  pub precache_optional: Vec<String>,
  #[serde(deserialize_with = "deserialize_extensions")]
  pub static_extensions: Vec<String>,
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      namespace: "weatherproof".to_string(),
      version: "v1".to_string(),
      api_prefix: "/api/".to_string(),
      offline_page: "/offline.html".to_string(),
      precache_required: vec!["/".to_string()],
      precache_optional: Vec::new(),
      static_extensions: [
        "js", "css", "png", "jpg", "jpeg", "gif", "svg", "ico", "webp", "woff", "woff2", "ttf",
      ]
      .iter()
      .map(|ext| ext.to_string())
      .collect(),
      database: None,
    }
  }
}

/// Accepts `js` or `.JS` alike.
fn deserialize_extensions<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
  pub database: Option<PathBuf>,
  pub lease_ttl_secs: u64,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      database: None,
      lease_ttl_secs: 60,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GuardSettings {
  pub min_interval_ms: u64,
  pub burst_window_ms: u64,
  pub burst_limit: usize,
  pub block_secs: u64,
  pub cleanup_interval_secs: u64,
}

impl Default for GuardSettings {
  fn default() -> Self {
    Self {
      min_interval_ms: 1000,
      burst_window_ms: 5000,
      burst_limit: 5,
      block_secs: 60,
      cleanup_interval_secs: 60,
    }
  }
}

impl GuardSettings {
  pub fn to_config(&self) -> GuardConfig {
    GuardConfig {
      min_interval: Duration::from_millis(self.min_interval_ms),
      burst_window: Duration::from_millis(self.burst_window_ms),
      burst_limit: self.burst_limit,
      block_duration: Duration::from_secs(self.block_secs),
      cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
  pub failure_threshold: u32,
  pub recovery_timeout_secs: u64,
  pub success_threshold: u32,
}

impl Default for BreakerSettings {
  fn default() -> Self {
    Self {
      failure_threshold: 5,
      recovery_timeout_secs: 30,
      success_threshold: 3,
    }
  }
}

impl BreakerSettings {
  pub fn to_config(&self) -> BreakerConfig {
    BreakerConfig {
      failure_threshold: self.failure_threshold.max(1),
      recovery_timeout: Duration::from_secs(self.recovery_timeout_secs),
      success_threshold: self.success_threshold.max(1),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoherencyConfig {
  /// Path on the origin, or an absolute URL
  pub endpoint: String,
  pub poll_interval_secs: u64,
}

impl Default for CoherencyConfig {
  fn default() -> Self {
    Self {
      endpoint: "/api/cache-control".to_string(),
      poll_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
  pub bind: SocketAddr,
  pub database: Option<PathBuf>,
}

impl Default for ControlPlaneConfig {
  fn default() -> Self {
    Self {
      bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  pub message_timeout_secs: u64,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    Self {
      message_timeout_secs: 10,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./weatherproof.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/weatherproof/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/weatherproof/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("weatherproof.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("weatherproof").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.origin_url()?;
    Ok(config)
  }

  fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<String> {
    let url = self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))?;
    Ok(url.to_string())
  }

  pub fn cache_settings(&self) -> Result<CacheSettings> {
    let resolve_all = |paths: &[String]| -> Result<Vec<String>> {
      paths.iter().map(|p| self.resolve(p)).collect()
    };

    Ok(CacheSettings {
      tiers: CacheTiers::new(&self.cache.namespace, &self.cache.version),
      api_prefix: self.cache.api_prefix.clone(),
      static_extensions: self.cache.static_extensions.clone(),
      offline_page: self.resolve(&self.cache.offline_page)?,
      precache_required: resolve_all(&self.cache.precache_required)?,
      precache_optional: resolve_all(&self.cache.precache_optional)?,
    })
  }

  pub fn coherency_endpoint(&self) -> Result<String> {
    self.resolve(&self.coherency.endpoint)
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_secs(self.coherency.poll_interval_secs.max(1))
  }

  pub fn lease_ttl(&self) -> Duration {
    Duration::from_secs(self.queue.lease_ttl_secs.max(1))
  }

  pub fn message_timeout(&self) -> Duration {
    Duration::from_secs(self.worker.message_timeout_secs.max(1))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    db::resolve_path(self.cache.database.as_deref(), "cache.db")
  }

  pub fn queue_db_path(&self) -> Result<PathBuf> {
    db::resolve_path(self.queue.database.as_deref(), "queue.db")
  }

  pub fn control_plane_db_path(&self) -> Result<PathBuf> {
    db::resolve_path(self.control_plane.database.as_deref(), "control-plane.db")
  }

  /// Get the operator token from environment variables.
  ///
  /// Checks WEATHERPROOF_ADMIN_TOKEN first, then CACHE_ADMIN_TOKEN as fallback.
  pub fn operator_token() -> Option<String> {
    std::env::var("WEATHERPROOF_ADMIN_TOKEN")
      .or_else(|_| std::env::var("CACHE_ADMIN_TOKEN"))
      .ok()
      .filter(|token| !token.trim().is_empty())
  }
}
