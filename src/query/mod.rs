//! Live queries over the store.
//!
//! Each query shape (object, list, object set, links, aggregation, function)
//! maps its canonicalized options to a [`CacheKey`] and is created once per
//! key. A query can be fetched once or subscribed to; subscribers follow the
//! subject of the query's key.
//!
//! ```ignore
//! let query = store.list_query(ListOptions::new("Employee").filter(w))?;
//! let employees = query.fetch().await?;
//!
//! let mut sub = query.subscribe();
//! while let Ok(snapshot) = sub.changed().await {
//!     render(sub.objects());
//! }
//! ```

mod aggregation;
mod function;
mod links;
mod list;
mod object;
mod object_set;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::cache::{CacheKey, Changes, KeyGuard, OptimisticId, Snapshot, Store};
use crate::error::{Result, SyncError};
use crate::ontology::ObjectHolder;

pub use aggregation::{AggregationOptions, AggregationQuery};
pub use function::{FunctionOptions, FunctionQuery};
pub use links::LinkOptions;
pub use list::{CollectionQuery, ListOptions};
pub use object::ObjectQuery;
pub use object_set::ObjectSetOptions;

/// Hooks the store uses to keep live queries current.
#[async_trait]
pub trait LiveQuery: Send + Sync {
  fn cache_key(&self) -> &CacheKey;

  /// React to a committed transaction that did not write this query's key.
  async fn maybe_update_and_revalidate(
    self: Arc<Self>,
    changes: Arc<Changes>,
    optimistic_id: Option<OptimisticId>,
  ) -> Result<()>;

  /// Revalidate if this query's results depend on `object_type`.
  async fn invalidate_object_type(self: Arc<Self>, object_type: String, changes: Option<Arc<Changes>>) -> Result<()>;

  async fn revalidate(self: Arc<Self>, force: bool) -> Result<()>;
}

type Pending = Shared<BoxFuture<'static, Result<()>>>;

/// Shared fetch bookkeeping for every query kind.
///
/// At most one fetch runs at a time unless forced. A forced fetch bumps the
/// generation; results of older generations are discarded.
pub(crate) struct QueryCore {
  store: Weak<Store>,
  key: CacheKey,
  pending: Mutex<Option<Pending>>,
  generation: AtomicU64,
  last_loaded: Mutex<Option<Instant>>,
}

impl QueryCore {
  pub(crate) fn new(store: &Store, key: CacheKey) -> Self {
    Self {
      store: store.weak(),
      key,
      pending: Mutex::new(None),
      generation: AtomicU64::new(0),
      last_loaded: Mutex::new(None),
    }
  }

  pub(crate) fn key(&self) -> &CacheKey {
    &self.key
  }

  pub(crate) fn store(&self) -> Result<Arc<Store>> {
    self.store.upgrade().ok_or(SyncError::StoreDropped)
  }

  pub(crate) fn is_current(&self, generation: u64) -> bool {
    self.generation.load(Ordering::SeqCst) == generation
  }

  pub(crate) fn mark_loaded(&self) {
    *self.last_loaded.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
  }

  pub(crate) fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  /// Start a new generation, invalidating results of any fetch in flight.
  pub(crate) fn next_generation(&self) -> u64 {
    self.generation.fetch_add(1, Ordering::SeqCst) + 1
  }

  fn is_fresh(&self, store: &Store) -> bool {
    let loaded = store
      .read(&self.key)
      .is_some_and(|e| e.status.is_loaded());
    let last = *self.last_loaded.lock().unwrap_or_else(|e| e.into_inner());
    loaded
      && last.is_some_and(|t| {
        let interval = store.config().dedupe_interval;
        !interval.is_zero() && t.elapsed() < interval
      })
  }

  /// Run `start(generation)` unless an unforced call can join the fetch in
  /// flight or the loaded value is still within the dedupe interval.
  pub(crate) async fn revalidate<F>(&self, force: bool, start: F) -> Result<()>
  where
    F: FnOnce(u64) -> BoxFuture<'static, Result<()>>,
  {
    let fut = {
      let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
      let running = pending.as_ref().filter(|f| f.peek().is_none()).cloned();
      match running {
        Some(running) if !force => running,
        _ => {
          if !force && self.is_fresh(&*self.store()?) {
            return Ok(());
          }
          let fut = start(self.next_generation()).shared();
          *pending = Some(fut.clone());
          fut
        }
      }
    };
    fut.await
  }
}

/// A subscription to one cache key. Dropping it releases the key.
pub struct Subscription {
  store: Weak<Store>,
  key: CacheKey,
  rx: watch::Receiver<Snapshot>,
  stream_task: Option<JoinHandle<()>>,
  _retain: KeyGuard,
}

impl Subscription {
  pub(crate) fn new(store: &Store, key: &CacheKey) -> Self {
    Self {
      store: store.weak(),
      key: key.clone(),
      rx: store.subject(key),
      stream_task: None,
      _retain: store.retain(key),
    }
  }

  pub(crate) fn with_stream_task(mut self, task: JoinHandle<()>) -> Self {
    self.stream_task = Some(task);
    self
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Latest visible value.
  pub fn current(&self) -> Snapshot {
    self.rx.borrow().clone()
  }

  /// Wait for the next change. Errors once the key has been collected or the
  /// store dropped.
  pub async fn changed(&mut self) -> Result<Snapshot> {
    self.rx.changed().await.map_err(|_| SyncError::StoreDropped)?;
    Ok(self.rx.borrow_and_update().clone())
  }

  pub fn object(&self) -> Option<ObjectHolder> {
    self.current().entry.and_then(|e| e.object().cloned())
  }

  /// Members of a collection subscription, resolved to their visible holders.
  pub fn objects(&self) -> Vec<ObjectHolder> {
    let snapshot = self.current();
    match (self.store.upgrade(), snapshot.entry.as_ref().and_then(|e| e.collection())) {
      (Some(store), Some(collection)) => store.resolve(collection),
      _ => Vec::new(),
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(task) = self.stream_task.take() {
      task.abort();
    }
  }
}

/// Kick off a revalidation in the background, logging failures.
pub(crate) fn spawn_revalidate(query: Arc<dyn LiveQuery>) {
  if let Ok(handle) = tokio::runtime::Handle::try_current() {
    handle.spawn(async move {
      let key = query.cache_key().clone();
      if let Err(e) = query.revalidate(false).await {
        tracing::warn!(key = %key, error = %e, "background revalidation failed");
      }
    });
  }
}
