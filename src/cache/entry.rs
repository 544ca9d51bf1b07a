//! Cache entries and the snapshots subjects publish.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use super::key::CacheKey;
use crate::error::SyncError;
use crate::ontology::ObjectHolder;

/// Load state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
  /// Known key, nothing fetched yet
  Init,
  /// Fetch in flight; the value (if any) is the previous one
  Loading,
  Loaded,
  Error,
}

impl Status {
  pub fn is_loading(&self) -> bool {
    matches!(self, Status::Loading)
  }

  pub fn is_loaded(&self) -> bool {
    matches!(self, Status::Loaded)
  }
}

/// Ordered object keys of a list, object set or link query.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CollectionData {
  pub data: Vec<CacheKey>,
  pub total_count: Option<u64>,
}

#[derive(Debug, Clone)]
pub enum CacheValue {
  Object(ObjectHolder),
  Collection(CollectionData),
  Aggregation(Arc<Value>),
  Function(Arc<Value>),
}

impl CacheValue {
  pub fn as_object(&self) -> Option<&ObjectHolder> {
    match self {
      CacheValue::Object(o) => Some(o),
      _ => None,
    }
  }

  pub fn as_collection(&self) -> Option<&CollectionData> {
    match self {
      CacheValue::Collection(c) => Some(c),
      _ => None,
    }
  }

  pub fn as_json(&self) -> Option<&Arc<Value>> {
    match self {
      CacheValue::Aggregation(v) | CacheValue::Function(v) => Some(v),
      _ => None,
    }
  }
}

/// One immutable version of a cached value.
#[derive(Debug, Clone)]
pub struct Entry {
  pub cache_key: CacheKey,
  pub value: Option<CacheValue>,
  pub status: Status,
  pub error: Option<SyncError>,
  pub last_updated: DateTime<Utc>,
}

impl Entry {
  pub fn new(cache_key: CacheKey, value: Option<CacheValue>, status: Status) -> Self {
    Self {
      cache_key,
      value,
      status,
      error: None,
      last_updated: Utc::now(),
    }
  }

  pub fn object(&self) -> Option<&ObjectHolder> {
    self.value.as_ref().and_then(CacheValue::as_object)
  }

  pub fn collection(&self) -> Option<&CollectionData> {
    self.value.as_ref().and_then(CacheValue::as_collection)
  }
}

/// What a subject publishes: the visible entry for its key.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
  pub entry: Option<Arc<Entry>>,
  /// The visible value comes from an optimistic layer.
  pub is_optimistic: bool,
}

impl Snapshot {
  pub fn status(&self) -> Status {
    self.entry.as_ref().map(|e| e.status).unwrap_or(Status::Init)
  }

  pub fn value(&self) -> Option<&CacheValue> {
    self.entry.as_ref().and_then(|e| e.value.as_ref())
  }

  pub fn error(&self) -> Option<&SyncError> {
    self.entry.as_ref().and_then(|e| e.error.as_ref())
  }
}
