//! Error types for the sync layer.
//!
//! Every error is `Clone`: in-flight fetches, optimistic results and bulk
//! loads are shared between several waiters, and each waiter gets its own copy
//! of the same failure.

use thiserror::Error;

/// Failure reported by the remote data source collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
  /// The service answered with a non-success status.
  #[error("remote returned HTTP {status}: {message}")]
  Http { status: u16, message: String },
  /// The request never produced a response (connect, TLS, timeout).
  #[error("transport error: {0}")]
  Transport(String),
  /// The response body could not be decoded.
  #[error("failed to decode response: {0}")]
  Decode(String),
  /// The collaborator does not implement this call.
  #[error("operation not supported by this data source: {0}")]
  Unsupported(String),
}

impl From<reqwest::Error> for RemoteError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      RemoteError::Decode(e.to_string())
    } else {
      RemoteError::Transport(e.to_string())
    }
  }
}

/// Errors surfaced by the store, queries and mutation helpers.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
  #[error(transparent)]
  Remote(#[from] RemoteError),

  /// A prior cache entry was required but is absent.
  #[error("no such cached entry: {key}")]
  NoSuchCachedEntry { key: String },

  /// An optimistic `create_object` could not be materialized.
  #[error("optimistic creation of {object_type} {primary_key} failed: {message}")]
  OptimisticCreationFailed {
    object_type: String,
    primary_key: String,
    message: String,
  },

  /// The remote returned no object for the requested key.
  #[error("{object_type} object not found: {primary_key}")]
  ObjectNotFound {
    object_type: String,
    primary_key: String,
  },

  /// Object type metadata names no such link.
  #[error("{object_type} has no link named {link}")]
  UnknownLink { object_type: String, link: String },

  #[error("invalid where clause: {0}")]
  InvalidWhereClause(String),

  #[error("invalid primary key: {0}")]
  InvalidPrimaryKey(String),

  /// The store backing a query or subscription has been dropped.
  #[error("store has been dropped")]
  StoreDropped,

  /// A cache key resolved to a query of a different kind.
  #[error("cached query for {key} has an unexpected type")]
  QueryTypeMismatch { key: String },
}

impl SyncError {
  pub fn no_such_entry(key: impl std::fmt::Display) -> Self {
    SyncError::NoSuchCachedEntry {
      key: key.to_string(),
    }
  }

  pub fn not_found(object_type: impl Into<String>, primary_key: impl std::fmt::Display) -> Self {
    SyncError::ObjectNotFound {
      object_type: object_type.into(),
      primary_key: primary_key.to_string(),
    }
  }

  /// True for the distinguishable optimistic-creation failure.
  pub fn is_optimistic_creation_failure(&self) -> bool {
    matches!(self, SyncError::OptimisticCreationFailed { .. })
  }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
