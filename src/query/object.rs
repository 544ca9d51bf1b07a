//! Single-object queries.

use async_trait::async_trait;
use futures::future::FutureExt;
use std::sync::Arc;

use super::{spawn_revalidate, LiveQuery, QueryCore, Subscription};
use crate::cache::{BatchOptions, CacheKey, Changes, OptimisticId, Status, Store};
use crate::error::{Result, SyncError};
use crate::ontology::{ObjectHolder, ObjectLocator, PrimaryKey};

pub struct ObjectQuery {
  core: QueryCore,
  object_type: String,
  primary_key: PrimaryKey,
}

impl Store {
  /// The query for one object, created on first use.
  pub fn object_query(&self, object_type: &str, primary_key: PrimaryKey) -> Result<Arc<ObjectQuery>> {
    let key = self.cache_keys().object(object_type, primary_key.clone());
    self.get_or_create_query(&key, || ObjectQuery {
      core: QueryCore::new(self, key.clone()),
      object_type: object_type.to_string(),
      primary_key,
    })
  }
}

impl ObjectQuery {
  pub fn locator(&self) -> ObjectLocator {
    ObjectLocator::new(self.object_type.clone(), self.primary_key.clone())
  }

  /// Load (or reuse) the object.
  pub async fn fetch(self: &Arc<Self>) -> Result<ObjectHolder> {
    self.clone().revalidate(false).await?;
    self.current()
  }

  /// The cached object, without fetching.
  pub fn current(&self) -> Result<ObjectHolder> {
    self
      .core
      .store()?
      .read(self.core.key())
      .and_then(|e| e.object().cloned())
      .ok_or_else(|| SyncError::not_found(self.object_type.clone(), &self.primary_key))
  }

  /// Follow the object. Starts a load in the background.
  pub fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
    let store = self.core.store()?;
    let sub = Subscription::new(&store, self.core.key());
    spawn_revalidate(self.clone());
    Ok(sub)
  }

  async fn load(self: Arc<Self>, generation: u64, direct: bool) -> Result<()> {
    let store = self.core.store()?;
    let key = self.core.key().clone();
    store.write_batch(None, |ctx| ctx.set_status(&key, Status::Loading, None));

    let loaded = if direct {
      store
        .remote()
        .fetch_object_by_key(&self.object_type, &self.primary_key)
        .await
        .map_err(SyncError::from)
        .and_then(|found| {
          found
            .map(ObjectHolder::new)
            .ok_or_else(|| SyncError::not_found(self.object_type.clone(), &self.primary_key))
        })
    } else {
      store
        .loader()
        .fetch(self.object_type.clone(), self.primary_key.clone())
        .await
    };

    if !self.core.is_current(generation) {
      return Ok(());
    }

    match loaded {
      Ok(holder) => {
        store.batch(BatchOptions::default(), |ctx| ctx.write_object(holder));
        self.core.mark_loaded();
        Ok(())
      }
      Err(SyncError::ObjectNotFound {
        object_type,
        primary_key,
      }) => {
        let locator = self.locator();
        store.batch(BatchOptions::default(), |ctx| {
          ctx.delete_object(&locator);
          ctx.set_status(
            &key,
            Status::Error,
            Some(SyncError::ObjectNotFound {
              object_type: object_type.clone(),
              primary_key: primary_key.clone(),
            }),
          );
        });
        Err(SyncError::ObjectNotFound {
          object_type,
          primary_key,
        })
      }
      Err(e) => {
        store.write_batch(None, |ctx| ctx.set_status(&key, Status::Error, Some(e.clone())));
        Err(e)
      }
    }
  }
}

#[async_trait]
impl LiveQuery for ObjectQuery {
  fn cache_key(&self) -> &CacheKey {
    self.core.key()
  }

  async fn maybe_update_and_revalidate(
    self: Arc<Self>,
    _changes: Arc<Changes>,
    _optimistic_id: Option<OptimisticId>,
  ) -> Result<()> {
    // object writes reach the subject directly
    Ok(())
  }

  async fn invalidate_object_type(self: Arc<Self>, object_type: String, changes: Option<Arc<Changes>>) -> Result<()> {
    if object_type != self.object_type {
      return Ok(());
    }
    if changes.is_some_and(|c| c.modified.contains(self.core.key())) {
      return Ok(());
    }
    self.revalidate(true).await
  }

  /// Forced revalidation skips the bulk loader and fetches the object
  /// directly.
  async fn revalidate(self: Arc<Self>, force: bool) -> Result<()> {
    let this = self.clone();
    self
      .core
      .revalidate(force, move |generation| this.load(generation, force).boxed())
      .await
  }
}
