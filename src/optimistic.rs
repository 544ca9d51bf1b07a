//! Speculative writes for pending mutations.
//!
//! An [`OptimisticJob`] writes its predicted objects into a layer of its own
//! and removes that layer exactly once when disposed, after its write has
//! become visible.

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{Changes, OptimisticId, Store};
use crate::error::{Result, SyncError};
use crate::ontology::{ObjectData, ObjectHolder, ObjectLocator, PrimaryKey};

type Creation = BoxFuture<'static, Result<ObjectHolder>>;
type JobResult = Shared<BoxFuture<'static, Result<Arc<Changes>>>>;

/// Collects the edits of one optimistic update.
pub struct OptimisticBuilder {
  store: Arc<Store>,
  creations: Vec<Creation>,
  updates: Vec<ObjectHolder>,
  deletes: Vec<ObjectLocator>,
}

impl OptimisticBuilder {
  fn new(store: Arc<Store>) -> Self {
    Self {
      store,
      creations: Vec::new(),
      updates: Vec::new(),
      deletes: Vec::new(),
    }
  }

  /// Predict a new object. The type's primary key field is looked up from
  /// metadata before the object is written.
  pub fn create_object(
    &mut self,
    object_type: impl Into<String>,
    primary_key: impl Into<PrimaryKey>,
    properties: Map<String, Value>,
  ) -> &mut Self {
    let store = self.store.clone();
    let object_type = object_type.into();
    let primary_key = primary_key.into();
    self.creations.push(
      async move {
        let metadata = store
          .object_metadata(&object_type)
          .await
          .map_err(|e| SyncError::OptimisticCreationFailed {
            object_type: object_type.clone(),
            primary_key: primary_key.to_string(),
            message: e.to_string(),
          })?;
        let mut properties = properties;
        properties.insert(metadata.primary_key.clone(), primary_key.to_json());
        Ok(ObjectHolder::new(ObjectData {
          object_type,
          primary_key,
          title: None,
          rid: None,
          properties,
        }))
      }
      .boxed(),
    );
    self
  }

  pub fn update_object(&mut self, holder: ObjectHolder) -> &mut Self {
    self.updates.push(holder);
    self
  }

  pub fn delete_object(&mut self, locator: ObjectLocator) -> &mut Self {
    self.deletes.push(locator);
    self
  }
}

/// A running optimistic update.
///
/// Dropping the job without calling [`OptimisticJob::dispose`] still removes
/// its layer, from a background task.
pub struct OptimisticJob {
  store: Arc<Store>,
  id: OptimisticId,
  result: JobResult,
  disposed: AtomicBool,
}

impl OptimisticJob {
  /// Build the edits and start writing them. Updates and deletes are
  /// visible when this returns; creations follow once their metadata loads.
  pub fn start(store: &Arc<Store>, build: impl FnOnce(&mut OptimisticBuilder)) -> Self {
    let id = store.open_layer();
    let mut builder = OptimisticBuilder::new(store.clone());
    build(&mut builder);
    let OptimisticBuilder {
      creations,
      updates,
      deletes,
      ..
    } = builder;

    let writer = store.clone();
    let result: JobResult = async move {
      let mut created = Vec::new();
      let mut failure = None;
      for outcome in join_all(creations).await {
        match outcome {
          Ok(holder) => created.push(holder),
          Err(e) => {
            warn!(layer = %id, error = %e, "optimistic creation failed");
            failure.get_or_insert(e);
          }
        }
      }

      let (_, changes) = writer.write_batch(Some(id), |ctx| {
        for holder in created.into_iter().chain(updates) {
          ctx.write_object(holder);
        }
        for locator in &deletes {
          ctx.delete_object(locator);
        }
      });
      writer.mark_layer_applied(id);
      let changes = Arc::new(changes);
      debug!(layer = %id, "optimistic write applied");
      writer.maybe_revalidate_queries(changes.clone(), Some(id)).await;

      match failure {
        Some(e) => Err(e),
        None => Ok(changes),
      }
    }
    .boxed()
    .shared();

    // write synchronously when nothing has to wait for metadata
    if result.clone().now_or_never().is_none() {
      if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(result.clone().map(|_| ()));
      }
    }

    Self {
      store: store.clone(),
      id,
      result,
      disposed: AtomicBool::new(false),
    }
  }

  pub fn id(&self) -> OptimisticId {
    self.id
  }

  /// Changes of the optimistic write, once it has been applied.
  pub async fn result(&self) -> Result<Arc<Changes>> {
    self.result.clone().await
  }

  /// Wait for the optimistic write, then remove its layer. Only the first
  /// call removes anything. Reports a failed creation after cleaning up.
  pub async fn dispose(&self) -> Result<()> {
    let outcome = self.result().await;
    if !self.disposed.swap(true, Ordering::SeqCst) {
      self.store.remove_layer(self.id);
    }
    outcome.map(|_| ())
  }
}

impl Drop for OptimisticJob {
  fn drop(&mut self) {
    if self.disposed.load(Ordering::SeqCst) {
      return;
    }
    let store = self.store.clone();
    let id = self.id;
    let result = self.result.clone();
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          let _ = result.await;
          store.remove_layer(id);
        });
      }
      Err(_) => {
        store.remove_layer(id);
      }
    }
  }
}
