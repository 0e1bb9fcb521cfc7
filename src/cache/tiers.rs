//! Versioned names of the three cache tiers.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
  Static,
  Api,
  Offline,
}

impl Tier {
  pub const ALL: [Tier; 3] = [Tier::Static, Tier::Api, Tier::Offline];

  pub fn as_str(&self) -> &'static str {
    match self {
      Tier::Static => "static",
      Tier::Api => "api",
      Tier::Offline => "offline",
    }
  }
}

impl fmt::Display for Tier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Store names for one deployed version, e.g. `weatherproof-api-v3`.
///
/// Bumping the version renames every store, so activation of the new version
/// drops everything written under the old schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheTiers {
  namespace: String,
  version: String,
}

impl CacheTiers {
  pub fn new(namespace: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      namespace: namespace.into(),
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn store_name(&self, tier: Tier) -> String {
    format!("{}-{}-{}", self.namespace, tier, self.version)
  }

  pub fn current_names(&self) -> Vec<String> {
    Tier::ALL.iter().map(|tier| self.store_name(*tier)).collect()
  }

  pub fn is_current(&self, store: &str) -> bool {
    Tier::ALL.iter().any(|tier| self.store_name(*tier) == store)
  }
}
