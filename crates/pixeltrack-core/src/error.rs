//! Error types for `pixeltrack-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("unknown action: {0:?}")]
  UnknownAction(String),

  #[error("invalid identity hash: {0:?}")]
  InvalidId(String),

  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Classifies a failure as transient (worth redelivering) or permanent.
///
/// Store backends implement this for their error type so the work queue can
/// decide between a backoff retry and the dead-letter table without knowing
/// anything about the backend.
pub trait Retryable {
  fn is_transient(&self) -> bool;
}
