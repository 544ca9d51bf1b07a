//! The remote ontology service, as seen by the cache.

mod api_types;
mod client;
mod metadata;
mod types;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::error::RemoteError;

pub use client::HttpDataSource;
pub use metadata::MetadataCache;
pub use types::{
  ActionEditResponse, LinkMetadata, ObjectData, ObjectHolder, ObjectLocator, ObjectSetDefinition,
  ObjectSetUpdate, ObjectTypeMetadata, PageRequest, PageResult, PrimaryKey,
};

/// Everything the cache needs from the remote data service.
///
/// Implementations report failures as [`RemoteError`]; the cache passes them
/// through to whichever call started the request.
#[async_trait]
pub trait RemoteDataSource: Send + Sync {
  /// `Ok(None)` when no such object exists.
  async fn fetch_object_by_key(
    &self,
    object_type: &str,
    primary_key: &PrimaryKey,
  ) -> Result<Option<ObjectData>, RemoteError>;

  async fn fetch_page(
    &self,
    object_set: &ObjectSetDefinition,
    request: &PageRequest,
  ) -> Result<PageResult, RemoteError>;

  async fn aggregate(&self, object_set: &ObjectSetDefinition, spec: &Value) -> Result<Value, RemoteError>;

  async fn apply_action(&self, action: &str, args: &Value) -> Result<ActionEditResponse, RemoteError>;

  /// Validate parameters without applying the action.
  async fn validate_action(&self, action: &str, args: &Value) -> Result<Value, RemoteError>;

  async fn fetch_type_metadata(&self, object_type: &str) -> Result<ObjectTypeMetadata, RemoteError>;

  async fn execute_function(&self, api_name: &str, _params: &Value) -> Result<Value, RemoteError> {
    Err(RemoteError::Unsupported(format!("function {}", api_name)))
  }

  /// Push updates for an object set. Sources without streaming keep the
  /// default, and queries fall back to pull-only.
  fn subscribe_object_set(
    &self,
    _object_set: &ObjectSetDefinition,
  ) -> Result<BoxStream<'static, ObjectSetUpdate>, RemoteError> {
    Err(RemoteError::Unsupported("object set subscriptions".to_string()))
  }
}
