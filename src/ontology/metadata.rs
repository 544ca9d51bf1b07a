//! Memoized object type metadata.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{ObjectTypeMetadata, RemoteDataSource};
use crate::error::{Result, SyncError};

type MetadataFuture = Shared<BoxFuture<'static, Result<Arc<ObjectTypeMetadata>>>>;

/// Fetches each object type's metadata once and shares the in-flight
/// request between concurrent callers. Failed lookups are not kept.
pub struct MetadataCache {
  remote: Arc<dyn RemoteDataSource>,
  entries: Mutex<HashMap<String, MetadataFuture>>,
}

impl MetadataCache {
  pub fn new(remote: Arc<dyn RemoteDataSource>) -> Self {
    Self {
      remote,
      entries: Mutex::new(HashMap::new()),
    }
  }

  pub async fn get(&self, object_type: &str) -> Result<Arc<ObjectTypeMetadata>> {
    let fut = {
      let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
      entries
        .entry(object_type.to_string())
        .or_insert_with(|| {
          let remote = self.remote.clone();
          let object_type = object_type.to_string();
          async move {
            let metadata = remote.fetch_type_metadata(&object_type).await?;
            Ok::<_, SyncError>(Arc::new(metadata))
          }
          .boxed()
          .shared()
        })
        .clone()
    };

    let result = fut.await;
    if result.is_err() {
      self
        .entries
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(object_type);
    }
    result
  }
}
