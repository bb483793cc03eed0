//! Error types for the offline engine.
//!
//! Storage failures surface as [`StoreError`], network failures as
//! [`TransportError`]. Strategy execution combines both in [`RouteError`].

use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by the persistent local store.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The storage engine rejected an operation.
  #[error("storage error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// Filesystem failure around the database file.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  /// The partition was never opened.
  #[error("partition not found: {partition}")]
  PartitionNotFound { partition: String },

  /// A partition was reopened with an incompatible primary key.
  #[error("partition {partition} has primary key {found:?}, expected {expected:?}")]
  Schema {
    partition: String,
    expected: String,
    found: String,
  },

  /// The partition declares no index with this name.
  #[error("partition {partition} has no index {index}")]
  IndexNotFound { partition: String, index: String },

  /// A record cannot be stored (not an object, missing primary key, ...).
  #[error("invalid record: {reason}")]
  InvalidRecord { reason: String },

  /// JSON encoding or decoding failed.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A blocking task was cancelled, panicked, or hit a poisoned lock.
  #[error("background task failed: {0}")]
  TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
  fn from(err: tokio::task::JoinError) -> Self {
    Self::TaskJoin(err.to_string())
  }
}

/// Transport-level failures. Only these count as "offline".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
  #[error("request timed out after {0:?}")]
  Timeout(std::time::Duration),

  #[error("connection failed: {0}")]
  Connect(String),

  #[error("invalid url: {0}")]
  InvalidUrl(String),

  #[error("request failed: {0}")]
  Request(String),
}

impl From<reqwest::Error> for TransportError {
  fn from(err: reqwest::Error) -> Self {
    if err.is_connect() {
      Self::Connect(err.to_string())
    } else {
      Self::Request(err.to_string())
    }
  }
}

/// Failure while routing a request through a strategy.
#[derive(Debug, Error)]
pub enum RouteError {
  #[error(transparent)]
  Transport(#[from] TransportError),

  #[error(transparent)]
  Store(#[from] StoreError),
}

/// Errors from the engine root object.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Route(#[from] RouteError),

  /// Configuration values the engine cannot use.
  #[error("config: {0}")]
  Config(String),

  /// A lifecycle step was attempted out of order.
  #[error("lifecycle: {0}")]
  Lifecycle(String),

  /// A control message could not be parsed.
  #[error("malformed message: {0}")]
  Message(String),

  /// The event loop has shut down.
  #[error("engine event loop is closed")]
  Closed,
}
