//! Runtime configuration, layered from an optional TOML file and
//! `PIXELTRACK_*` environment variables.

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::Deserialize;

use crate::queue::RetryPolicy;

/// Server configuration. Every field has a default, so an empty (or
/// missing) file is a valid configuration.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
  pub host:            String,
  pub port:            u16,
  pub store_path:      PathBuf,
  /// Number of aggregation workers.
  pub workers:         usize,
  /// Events buffered between the front door and the workers.
  pub queue_capacity:  usize,
  /// Delivery attempts per event before it is dead-lettered.
  pub max_attempts:    u32,
  /// Bound on a single delivery attempt.
  pub op_timeout_ms:   u64,
  pub backoff_base_ms: u64,
  pub backoff_max_ms:  u64,
}

impl Default for ServerConfig {
  fn default() -> Self {
    Self {
      host:            "127.0.0.1".to_string(),
      port:            5000,
      store_path:      PathBuf::from("pixeltrack.db"),
      workers:         4,
      queue_capacity:  10_000,
      max_attempts:    5,
      op_timeout_ms:   5_000,
      backoff_base_ms: 200,
      backoff_max_ms:  30_000,
    }
  }
}

impl ServerConfig {
  /// Load from `path` (optional) overlaid with the environment,
  /// e.g. `PIXELTRACK_PORT=8080`.
  pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
    config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("PIXELTRACK"))
      .build()?
      .try_deserialize()
  }

  pub fn address(&self) -> String { format!("{}:{}", self.host, self.port) }

  pub fn retry_policy(&self) -> RetryPolicy {
    RetryPolicy {
      max_attempts: self.max_attempts.max(1),
      op_timeout:   Duration::from_millis(self.op_timeout_ms),
      backoff_base: Duration::from_millis(self.backoff_base_ms),
      backoff_max:  Duration::from_millis(self.backoff_max_ms),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn missing_file_yields_defaults() {
    let cfg = ServerConfig::load(Path::new("/nonexistent/pixeltrack.toml")).unwrap();
    assert_eq!(cfg, ServerConfig::default());
  }

  #[test]
  fn retry_policy_never_allows_zero_attempts() {
    let cfg = ServerConfig { max_attempts: 0, ..ServerConfig::default() };
    assert_eq!(cfg.retry_policy().max_attempts, 1);
  }
}
