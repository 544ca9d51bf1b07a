//! The store: sole owner of cache entries, subjects and live queries.

use futures::future::join_all;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::canonical::{Canonical, Canonicalizer};
use super::changes::Changes;
use super::derived::DerivedPropertyNames;
use super::entry::{CacheValue, CollectionData, Entry, Snapshot, Status};
use super::key::{CacheKey, CacheKeys};
use super::layer::{LayerStack, LayerStatus, OptimisticId};
use super::order_by::OrderBy;
use super::where_clause::WhereClause;
use crate::bulk_loader::BulkObjectLoader;
use crate::config::StoreConfig;
use crate::error::{Result, SyncError};
use crate::ontology::{
  MetadataCache, ObjectHolder, ObjectLocator, ObjectTypeMetadata, PrimaryKey, RemoteDataSource,
};
use crate::query::LiveQuery;

/// Options for one write transaction.
#[derive(Debug, Clone, Copy, Default)]
pub struct BatchOptions {
  /// Record every write into this layer instead of confirmed state.
  pub optimistic_id: Option<OptimisticId>,
}

impl BatchOptions {
  pub fn optimistic(id: OptimisticId) -> Self {
    Self {
      optimistic_id: Some(id),
    }
  }
}

struct QueryHandle {
  live: Arc<dyn LiveQuery>,
  any: Arc<dyn Any + Send + Sync>,
}

#[derive(Debug, Clone, Copy)]
struct RefCount {
  count: usize,
  released_at: Option<Instant>,
}

impl RefCount {
  fn released_now() -> Self {
    Self {
      count: 0,
      released_at: Some(Instant::now()),
    }
  }
}

#[derive(Default)]
struct StoreState {
  stack: LayerStack,
  subjects: HashMap<CacheKey, watch::Sender<Snapshot>>,
  queries: HashMap<CacheKey, QueryHandle>,
  /// Object key to the collection keys listing it.
  members: HashMap<CacheKey, HashSet<CacheKey>>,
  ref_counts: HashMap<CacheKey, RefCount>,
}

impl StoreState {
  fn snapshot(&self, key: &CacheKey) -> Snapshot {
    Snapshot {
      entry: self.stack.get(key),
      is_optimistic: self.stack.is_optimistic(key),
    }
  }

  fn touch_ref(&mut self, key: &CacheKey) {
    self
      .ref_counts
      .entry(key.clone())
      .or_insert_with(RefCount::released_now);
  }

  /// Notify every subject whose visible value changed since `before`, plus
  /// the subjects of collections listing a changed object.
  fn publish(&mut self, before: HashMap<CacheKey, Option<Arc<Entry>>>) -> usize {
    let mut dirty = HashSet::new();
    for (key, old) in before {
      let now = self.stack.get(&key);
      let same = match (&old, &now) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
      };
      if !same {
        if let Some(collections) = self.members.get(&key) {
          dirty.extend(collections.iter().cloned());
        }
        dirty.insert(key);
      }
    }

    for key in &dirty {
      if let Some(subject) = self.subjects.get(key) {
        subject.send_replace(self.snapshot(key));
      }
    }
    dirty.len()
  }
}

fn same_members(prev: Option<&CollectionData>, next: &CollectionData) -> bool {
  prev.is_some_and(|p| p == next)
}

/// Handle passed to a [`Store::batch`] callback.
///
/// Writes land in the transaction's layer (or confirmed state) immediately,
/// but subjects are only notified once the callback returns. An optimistic
/// batch whose layer has already been removed writes nothing.
pub struct BatchContext<'a> {
  store: &'a Store,
  state: &'a mut StoreState,
  optimistic_id: Option<OptimisticId>,
  layer_open: bool,
  changes: Changes,
  before: HashMap<CacheKey, Option<Arc<Entry>>>,
}

impl<'a> BatchContext<'a> {
  pub fn is_optimistic(&self) -> bool {
    self.optimistic_id.is_some()
  }

  pub fn optimistic_id(&self) -> Option<OptimisticId> {
    self.optimistic_id
  }

  /// False for an optimistic batch whose layer is gone.
  pub fn is_writable(&self) -> bool {
    self.layer_open
  }

  pub fn changes(&mut self) -> &mut Changes {
    &mut self.changes
  }

  pub fn cache_keys(&self) -> &CacheKeys {
    &self.store.cache_keys
  }

  /// Visible entry for `key`, including writes made earlier in this batch.
  pub fn read(&self, key: &CacheKey) -> Option<Arc<Entry>> {
    self.state.stack.get(key)
  }

  fn remember(&mut self, key: &CacheKey) {
    let stack = &self.state.stack;
    self
      .before
      .entry(key.clone())
      .or_insert_with(|| stack.get(key));
  }

  /// Entry this transaction would overwrite: the visible one for optimistic
  /// writes, the confirmed one otherwise.
  fn current_at_level(&self, key: &CacheKey) -> Option<Arc<Entry>> {
    match self.optimistic_id {
      Some(_) => self.state.stack.get(key),
      None => self.state.stack.get_base(key),
    }
  }

  /// Raw write. Does not record anything in [`Changes`].
  pub fn write(&mut self, key: &CacheKey, value: Option<CacheValue>, status: Status) -> Arc<Entry> {
    let entry = Arc::new(Entry::new(key.clone(), value, status));
    self.write_entry(entry.clone());
    entry
  }

  pub fn write_entry(&mut self, entry: Arc<Entry>) {
    if !self.layer_open {
      return;
    }
    let key = entry.cache_key.clone();
    self.remember(&key);
    self.state.touch_ref(&key);
    self.state.stack.write(self.optimistic_id, &key, Some(entry));
  }

  /// Raw delete. In an optimistic batch this hides the confirmed value.
  pub fn delete(&mut self, key: &CacheKey) {
    if !self.layer_open {
      return;
    }
    self.remember(key);
    self.state.stack.write(self.optimistic_id, key, None);
  }

  /// Update the load status of a confirmed entry, keeping its value.
  pub fn set_status(&mut self, key: &CacheKey, status: Status, error: Option<SyncError>) {
    let value = self.state.stack.get_base(key).and_then(|e| e.value.clone());
    let mut entry = Entry::new(key.clone(), value, status);
    entry.error = error;
    self.remember(key);
    self.state.touch_ref(key);
    self.state.stack.write(None, key, Some(Arc::new(entry)));
  }

  /// Write an object, keeping the cached holder when the data is unchanged so
  /// that equal objects stay reference-equal.
  pub fn write_object(&mut self, holder: ObjectHolder) -> (CacheKey, ObjectHolder) {
    let key = self
      .store
      .cache_keys
      .object(holder.object_type.clone(), holder.primary_key.clone());
    if !self.layer_open {
      return (key, holder);
    }

    if let Some(prev) = self.current_at_level(&key) {
      if let Some(existing) = prev.object() {
        if **existing == *holder {
          let existing = existing.clone();
          if !prev.status.is_loaded() {
            self.write(&key, Some(CacheValue::Object(existing.clone())), Status::Loaded);
          }
          return (key, existing);
        }
      }
    }

    let is_new = self
      .state
      .stack
      .get(&key)
      .and_then(|e| e.object().cloned())
      .is_none();
    self.write(&key, Some(CacheValue::Object(holder.clone())), Status::Loaded);
    self.changes.register_object(&key, &holder, is_new);
    (key, holder)
  }

  pub fn delete_object(&mut self, locator: &ObjectLocator) {
    if !self.layer_open {
      return;
    }
    let key = self.store.cache_keys.object_at(locator);
    self.delete(&key);
    self.changes.delete_object(&key, locator);
  }

  /// Write the member list of a collection. Returns false when nothing changed.
  pub fn write_collection(&mut self, key: &CacheKey, data: CollectionData, status: Status) -> bool {
    if !self.layer_open {
      return false;
    }
    let prev = self.state.stack.get(key);
    let prev_data = prev.as_ref().and_then(|e| e.collection());
    if same_members(prev_data, &data) && prev.as_ref().map(|e| e.status) == Some(status) {
      return false;
    }
    let is_new = prev_data.is_none();

    if let Some(old) = prev_data {
      for member in &old.data {
        if !data.data.contains(member) {
          if let Some(set) = self.state.members.get_mut(member) {
            set.remove(key);
          }
        }
      }
    }
    for member in &data.data {
      self
        .state
        .members
        .entry(member.clone())
        .or_default()
        .insert(key.clone());
    }

    let members_changed = !same_members(prev_data, &data);
    self.write(key, Some(CacheValue::Collection(data)), status);
    if members_changed {
      self.changes.register_list(key, is_new);
    }
    true
  }

  /// Write a computed JSON result. Returns false when it is unchanged.
  pub fn write_value(&mut self, key: &CacheKey, value: CacheValue, status: Status) -> bool {
    if !self.layer_open {
      return false;
    }
    let prev = self.state.stack.get(key);
    let prev_json = prev.as_ref().and_then(|e| e.value.as_ref()).and_then(CacheValue::as_json);
    let same = match (prev_json, value.as_json()) {
      (Some(a), Some(b)) => a == b,
      _ => false,
    };
    if same && prev.as_ref().map(|e| e.status) == Some(status) {
      return false;
    }
    let is_new = prev_json.is_none();
    self.write(key, Some(value), status);
    if !same {
      self.changes.register_list(key, is_new);
    }
    true
  }

  /// Visible holders of a collection's members, skipping deleted objects.
  pub fn resolve(&self, data: &CollectionData) -> Vec<ObjectHolder> {
    data
      .data
      .iter()
      .filter_map(|k| self.read(k).and_then(|e| e.object().cloned()))
      .collect()
  }
}

/// Drops one retain on a cache key.
pub struct KeyGuard {
  store: Weak<Store>,
  key: CacheKey,
}

impl Drop for KeyGuard {
  fn drop(&mut self) {
    if let Some(store) = self.store.upgrade() {
      store.release(&self.key);
    }
  }
}

/// Owns all cache state for one client.
pub struct Store {
  me: Weak<Store>,
  remote: Arc<dyn RemoteDataSource>,
  config: StoreConfig,
  metadata: Arc<MetadataCache>,
  loader: BulkObjectLoader,
  cache_keys: CacheKeys,
  where_clauses: Canonicalizer<WhereClause>,
  order_bys: Canonicalizer<OrderBy>,
  derived: Canonicalizer<DerivedPropertyNames>,
  state: Mutex<StoreState>,
}

impl Store {
  pub fn new(remote: Arc<dyn RemoteDataSource>, config: StoreConfig) -> Arc<Store> {
    let metadata = Arc::new(MetadataCache::new(remote.clone()));
    Arc::new_cyclic(|me| Store {
      me: me.clone(),
      loader: BulkObjectLoader::new(remote.clone(), metadata.clone(), &config),
      remote,
      config,
      metadata,
      cache_keys: CacheKeys::new(),
      where_clauses: Canonicalizer::new(),
      order_bys: Canonicalizer::new(),
      derived: Canonicalizer::new(),
      state: Mutex::new(StoreState::default()),
    })
  }

  fn state(&self) -> MutexGuard<'_, StoreState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub(crate) fn weak(&self) -> Weak<Store> {
    self.me.clone()
  }

  pub fn remote(&self) -> &Arc<dyn RemoteDataSource> {
    &self.remote
  }

  pub fn config(&self) -> &StoreConfig {
    &self.config
  }

  pub fn loader(&self) -> &BulkObjectLoader {
    &self.loader
  }

  pub fn cache_keys(&self) -> &CacheKeys {
    &self.cache_keys
  }

  pub fn canonical_where(&self, clause: WhereClause) -> Canonical<WhereClause> {
    self.where_clauses.canonicalize(clause)
  }

  pub fn canonical_order_by(&self, order_by: OrderBy) -> Canonical<OrderBy> {
    self.order_bys.canonicalize(order_by)
  }

  pub fn canonical_derived(&self, names: DerivedPropertyNames) -> Canonical<DerivedPropertyNames> {
    self.derived.canonicalize(names)
  }

  pub async fn object_metadata(&self, object_type: &str) -> Result<Arc<ObjectTypeMetadata>> {
    self.metadata.get(object_type).await
  }

  /// Visible entry for `key`.
  pub fn read(&self, key: &CacheKey) -> Option<Arc<Entry>> {
    self.state().stack.get(key)
  }

  pub fn snapshot(&self, key: &CacheKey) -> Snapshot {
    self.state().snapshot(key)
  }

  /// Visible holders of a collection's members.
  pub fn resolve(&self, data: &CollectionData) -> Vec<ObjectHolder> {
    let state = self.state();
    data
      .data
      .iter()
      .filter_map(|k| state.stack.get(k).and_then(|e| e.object().cloned()))
      .collect()
  }

  /// Receiver for the subject of `key`, created on first use.
  pub fn subject(&self, key: &CacheKey) -> watch::Receiver<Snapshot> {
    let mut state = self.state();
    if let Some(tx) = state.subjects.get(key) {
      return tx.subscribe();
    }
    let (tx, rx) = watch::channel(state.snapshot(key));
    state.subjects.insert(key.clone(), tx);
    rx
  }

  /// Run one write transaction and schedule query revalidation for its
  /// changes in the background.
  pub fn batch<R>(&self, options: BatchOptions, f: impl FnOnce(&mut BatchContext<'_>) -> R) -> R {
    let (value, changes) = self.write_batch(options.optimistic_id, f);
    self.propagate_detached(changes, options.optimistic_id);
    value
  }

  /// Run one write transaction and return its changes without propagating
  /// them. Subjects are notified before this returns.
  ///
  /// The callback runs under the store lock and must not call back into the
  /// store.
  pub fn write_batch<R>(
    &self,
    optimistic_id: Option<OptimisticId>,
    f: impl FnOnce(&mut BatchContext<'_>) -> R,
  ) -> (R, Changes) {
    let mut state = self.state();
    let layer_open = optimistic_id.map_or(true, |id| state.stack.has_layer(id));
    if !layer_open {
      debug!(layer = ?optimistic_id, "layer already removed, dropping optimistic writes");
    }
    let mut ctx = BatchContext {
      store: self,
      state: &mut *state,
      optimistic_id,
      layer_open,
      changes: Changes::new(),
      before: HashMap::new(),
    };
    let value = f(&mut ctx);
    let BatchContext {
      changes, before, ..
    } = ctx;

    let notified = state.publish(before);
    if !changes.is_empty() {
      debug!(
        optimistic = ?optimistic_id,
        added = changes.added.len(),
        modified = changes.modified.len(),
        deleted = changes.deleted.len(),
        notified,
        "committed batch"
      );
    }
    (value, changes)
  }

  fn propagate_detached(&self, changes: Changes, optimistic_id: Option<OptimisticId>) {
    if changes.is_empty() {
      return;
    }
    let Some(store) = self.me.upgrade() else {
      return;
    };
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          store
            .maybe_revalidate_queries(Arc::new(changes), optimistic_id)
            .await;
        });
      }
      Err(_) => debug!("no runtime, skipping query revalidation"),
    }
  }

  fn live_queries(&self) -> Vec<(CacheKey, Arc<dyn LiveQuery>)> {
    self
      .state()
      .queries
      .iter()
      .map(|(k, q)| (k.clone(), q.live.clone()))
      .collect()
  }

  /// Give every live query not written by this transaction a chance to
  /// update itself or revalidate. Failures are logged, not returned.
  pub async fn maybe_revalidate_queries(&self, changes: Arc<Changes>, optimistic_id: Option<OptimisticId>) {
    if changes.is_empty() {
      return;
    }
    let pending = self
      .live_queries()
      .into_iter()
      .filter(|(key, _)| !changes.contains(key))
      .map(|(key, query)| {
        let changes = changes.clone();
        async move {
          if let Err(e) = query.maybe_update_and_revalidate(changes, optimistic_id).await {
            warn!(key = %key, error = %e, "query revalidation failed");
          }
        }
      });
    join_all(pending).await;
  }

  /// Remove an optimistic layer as its own transaction.
  pub fn remove_layer(&self, id: OptimisticId) -> Changes {
    let mut state = self.state();
    let keys = state.stack.layer_keys(id);
    let before: HashMap<_, _> = keys.iter().map(|k| (k.clone(), state.stack.get(k))).collect();
    state.stack.remove_layer(id);

    let mut changes = Changes::new();
    for (key, old) in &before {
      let now = state.stack.get(key);
      let unchanged = match (old, &now) {
        (Some(a), Some(b)) => Arc::ptr_eq(a, b),
        (None, None) => true,
        _ => false,
      };
      if unchanged {
        continue;
      }
      match now {
        Some(entry) => match &entry.value {
          Some(CacheValue::Object(holder)) => changes.register_object(key, holder, old.is_none()),
          _ => changes.register_list(key, old.is_none()),
        },
        None => match key.object_locator() {
          Some(locator) => changes.delete_object(key, &locator),
          None => changes.delete_key(key),
        },
      }
    }

    let notified = state.publish(before);
    debug!(layer = %id, notified, "removed layer");
    changes
  }

  /// Open a new optimistic layer on top of the stack and return its id.
  pub fn open_layer(&self) -> OptimisticId {
    let id = self.state().stack.open_layer();
    debug!(layer = %id, "opened layer");
    id
  }

  pub fn has_layer(&self, id: OptimisticId) -> bool {
    self.state().stack.has_layer(id)
  }

  pub fn mark_layer_applied(&self, id: OptimisticId) {
    self.state().stack.set_status(id, LayerStatus::Applied);
  }

  pub fn layer_status(&self, id: OptimisticId) -> Option<LayerStatus> {
    self.state().stack.layer_status(id)
  }

  /// Look up the query for `key`, building it with `make` on first use.
  pub(crate) fn get_or_create_query<Q>(&self, key: &CacheKey, make: impl FnOnce() -> Q) -> Result<Arc<Q>>
  where
    Q: LiveQuery + 'static,
  {
    let mut state = self.state();
    if let Some(handle) = state.queries.get(key) {
      return handle
        .any
        .clone()
        .downcast::<Q>()
        .map_err(|_| SyncError::QueryTypeMismatch {
          key: key.to_string(),
        });
    }

    let query = Arc::new(make());
    state.queries.insert(
      key.clone(),
      QueryHandle {
        live: query.clone(),
        any: query.clone(),
      },
    );
    state.touch_ref(key);
    debug!(key = %key, "created query");
    Ok(query)
  }

  /// Force a reload of one object if it is cached or queried.
  pub async fn invalidate_object(&self, object_type: &str, primary_key: &PrimaryKey) -> Result<()> {
    let key = self.cache_keys.object(object_type, primary_key.clone());
    let known = {
      let state = self.state();
      state.queries.contains_key(&key) || state.stack.get(&key).is_some()
    };
    if !known {
      return Ok(());
    }
    info!(key = %key, "invalidating object");
    let store = self.me.upgrade().ok_or(SyncError::StoreDropped)?;
    let query = store.object_query(object_type, primary_key.clone())?;
    query.revalidate(true).await
  }

  /// Ask every live query to revalidate if it depends on `object_type`.
  /// Queries whose key is in `changes` are skipped. Every query is given
  /// its chance; the first failure is reported afterwards.
  pub async fn invalidate_object_type(&self, object_type: &str, changes: Option<Arc<Changes>>) -> Result<()> {
    info!(object_type, "invalidating object type");
    let queries = self.live_queries();
    let results = join_all(
      queries
        .into_iter()
        .filter(|(key, _)| changes.as_ref().map_or(true, |c| !c.modified.contains(key)))
        .map(|(_, q)| q.invalidate_object_type(object_type.to_string(), changes.clone())),
    )
    .await;
    results.into_iter().collect::<Result<Vec<_>>>().map(|_| ())
  }

  /// Force every live query to revalidate. The first failure is reported
  /// after all of them have finished.
  pub async fn invalidate_all(&self) -> Result<()> {
    let queries = self.live_queries();
    info!(queries = queries.len(), "invalidating all queries");
    let results = join_all(queries.into_iter().map(|(_, q)| q.revalidate(true))).await;
    results.into_iter().collect::<Result<Vec<_>>>().map(|_| ())
  }

  /// Live queries of one concrete kind.
  pub(crate) fn queries_of<Q>(&self) -> Vec<Arc<Q>>
  where
    Q: LiveQuery + 'static,
  {
    self
      .state()
      .queries
      .values()
      .filter_map(|h| h.any.clone().downcast::<Q>().ok())
      .collect()
  }

  pub(crate) fn retain(&self, key: &CacheKey) -> KeyGuard {
    let mut state = self.state();
    let rc = state
      .ref_counts
      .entry(key.clone())
      .or_insert_with(RefCount::released_now);
    rc.count += 1;
    rc.released_at = None;
    KeyGuard {
      store: self.me.clone(),
      key: key.clone(),
    }
  }

  fn release(&self, key: &CacheKey) {
    let mut state = self.state();
    if let Some(rc) = state.ref_counts.get_mut(key) {
      rc.count = rc.count.saturating_sub(1);
      if rc.count == 0 {
        rc.released_at = Some(Instant::now());
      }
    }
  }

  /// Drop unreferenced keys older than the configured TTL. Keys held by a
  /// pending layer or listed by a surviving collection are kept.
  pub fn gc(&self) -> usize {
    let ttl = self.config.key_ttl;
    let now = Instant::now();
    let mut state = self.state();

    let candidates: HashSet<CacheKey> = state
      .ref_counts
      .iter()
      .filter(|(_, rc)| rc.count == 0 && rc.released_at.is_some_and(|t| now - t >= ttl))
      .map(|(k, _)| k.clone())
      .collect();
    if candidates.is_empty() {
      return 0;
    }

    let mut protected: HashSet<CacheKey> = HashSet::new();
    for key in state.stack.keys() {
      if state.stack.is_optimistic(&key) {
        protected.insert(key.clone());
      }
      if candidates.contains(&key) {
        continue;
      }
      if let Some(collection) = state.stack.get(&key).and_then(|e| e.collection().cloned()) {
        protected.extend(collection.data);
      }
    }

    let expired: Vec<CacheKey> = candidates
      .into_iter()
      .filter(|k| !protected.contains(k))
      .collect();
    for key in &expired {
      state.queries.remove(key);
      state.subjects.remove(key);
      state.ref_counts.remove(key);
      state.members.remove(key);
      if let Some(entry) = state.stack.forget_base(key) {
        if let Some(collection) = entry.collection() {
          for member in &collection.data {
            if let Some(set) = state.members.get_mut(member) {
              set.remove(key);
            }
          }
        }
      }
    }
    if !expired.is_empty() {
      debug!(count = expired.len(), "collected cache keys");
    }
    expired.len()
  }

  /// Run [`Store::gc`] every `gc_interval` until the store is dropped.
  pub fn spawn_gc(self: &Arc<Self>) -> JoinHandle<()> {
    let weak = Arc::downgrade(self);
    let period = self.config.gc_interval;
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(period);
      loop {
        ticker.tick().await;
        match weak.upgrade() {
          Some(store) => {
            store.gc();
          }
          None => break,
        }
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::ontology::ObjectData;
  use crate::test_utils::MockDataSource;
  use serde_json::json;
  use std::time::Duration;

  fn store() -> Arc<Store> {
    Store::new(Arc::new(MockDataSource::new()), StoreConfig::default())
  }

  fn employee(pk: i64, name: &str) -> ObjectHolder {
    ObjectHolder::new(ObjectData {
      object_type: "Employee".into(),
      primary_key: PrimaryKey::Integer(pk),
      title: None,
      rid: None,
      properties: json!({"employeeId": pk, "name": name})
        .as_object()
        .cloned()
        .unwrap_or_default(),
    })
  }

  fn visible_name(store: &Store, key: &CacheKey) -> Option<serde_json::Value> {
    store
      .read(key)
      .and_then(|e| e.object().and_then(|o| o.property("name").cloned()))
  }

  #[test]
  fn test_batch_notifies_each_subject_once() {
    let store = store();
    let key = store.cache_keys().object("Employee", 1);
    let mut rx = store.subject(&key);
    assert!(!rx.has_changed().unwrap_or(true));

    let (_, changes) = store.write_batch(None, |ctx| {
      ctx.write_object(employee(1, "a"));
      ctx.write_object(employee(1, "b"));
      ctx.write_object(employee(1, "c"));
    });

    assert_eq!(changes.added.len(), 1);
    assert!(rx.has_changed().unwrap_or(false));
    let snap = rx.borrow_and_update().clone();
    assert_eq!(
      snap.entry.and_then(|e| e.object().and_then(|o| o.property("name").cloned())),
      Some(json!("c"))
    );
    assert!(!rx.has_changed().unwrap_or(true));
  }

  #[test]
  fn test_equal_writes_keep_holder_identity() {
    let store = store();
    let first = store.write_batch(None, |ctx| ctx.write_object(employee(1, "a")).1).0;
    let ((_, second), changes) = store.write_batch(None, |ctx| ctx.write_object(employee(1, "a")));
    assert!(ObjectHolder::ptr_eq(&first, &second));
    assert!(changes.is_empty());
  }

  #[test]
  fn test_layer_stacking_and_removal() {
    let store = store();
    let key = store.cache_keys().object("Employee", 1);
    store.write_batch(None, |ctx| ctx.write_object(employee(1, "v0")));

    let l1 = store.open_layer();
    let l2 = store.open_layer();
    store.write_batch(Some(l1), |ctx| ctx.write_object(employee(1, "v1")));
    store.write_batch(Some(l2), |ctx| ctx.write_object(employee(1, "v2")));
    assert_eq!(visible_name(&store, &key), Some(json!("v2")));
    assert!(store.snapshot(&key).is_optimistic);

    let mut rx = store.subject(&key);
    let changes = store.remove_layer(l2);
    assert_eq!(changes.modified.len(), 1);
    assert!(rx.has_changed().unwrap_or(false));
    rx.borrow_and_update();
    assert_eq!(visible_name(&store, &key), Some(json!("v1")));

    store.remove_layer(l1);
    assert_eq!(visible_name(&store, &key), Some(json!("v0")));
    assert!(!store.snapshot(&key).is_optimistic);

    // removing a layer twice is a no-op
    assert!(store.remove_layer(l1).is_empty());
  }

  #[test]
  fn test_removing_shadowed_layer_reports_nothing() {
    let store = store();
    let key = store.cache_keys().object("Employee", 1);
    let other = store.cache_keys().object("Employee", 2);
    let lower = store.open_layer();
    let upper = store.open_layer();
    store.write_batch(Some(lower), |ctx| {
      ctx.write_object(employee(1, "lower"));
      ctx.write_object(employee(2, "only lower"));
    });
    store.write_batch(Some(upper), |ctx| ctx.write_object(employee(1, "upper")));

    let mut rx = store.subject(&key);
    let changes = store.remove_layer(lower);
    assert!(!changes.contains(&key));
    assert!(changes.contains(&other));
    assert_eq!(changes.deleted.len(), 1);
    assert!(!rx.has_changed().unwrap_or(true));
    assert_eq!(visible_name(&store, &key), Some(json!("upper")));
  }

  #[test]
  fn test_writes_to_removed_layer_are_dropped() {
    let store = store();
    let key = store.cache_keys().object("Employee", 1);
    let id = store.open_layer();
    store.remove_layer(id);

    let (written, changes) = store.write_batch(Some(id), |ctx| {
      ctx.write_object(employee(1, "late"));
      ctx.is_writable()
    });
    assert!(!written);
    assert!(changes.is_empty());
    assert!(store.read(&key).is_none());
    assert_eq!(store.layer_status(id), None);
    assert!(!store.has_layer(id));
  }

  #[test]
  fn test_confirmed_write_under_equal_prediction_survives_layer_removal() {
    let store = store();
    let key = store.cache_keys().object("Employee", 1);
    store.write_batch(None, |ctx| ctx.write_object(employee(1, "old")));

    let id = store.open_layer();
    store.write_batch(Some(id), |ctx| ctx.write_object(employee(1, "new")));
    // the server confirms exactly the predicted data
    let ((_, confirmed), _) = store.write_batch(None, |ctx| ctx.write_object(employee(1, "new")));
    store.remove_layer(id);

    let visible = store.read(&key).and_then(|e| e.object().cloned());
    assert!(visible.is_some_and(|v| ObjectHolder::ptr_eq(&v, &confirmed)));
  }

  #[test]
  fn test_member_change_reemits_collection() {
    let store = store();
    let collection = store.cache_keys().get(crate::cache::CacheKeyParams::Function {
      api_name: "teamRoster".into(),
      params: "{}".into(),
    });
    let (member, _) = store.write_batch(None, |ctx| ctx.write_object(employee(1, "a"))).0;
    store.write_batch(None, |ctx| {
      ctx.write_collection(
        &collection,
        CollectionData {
          data: vec![member.clone()],
          total_count: None,
        },
        Status::Loaded,
      )
    });

    let mut rx = store.subject(&collection);
    rx.borrow_and_update();
    store.write_batch(None, |ctx| ctx.write_object(employee(1, "b")));
    assert!(rx.has_changed().unwrap_or(false));
  }

  #[tokio::test(start_paused = true)]
  async fn test_gc_respects_retains_and_layers() {
    let store = Store::new(
      Arc::new(MockDataSource::new()),
      StoreConfig::default().with_key_ttl(Duration::from_secs(10)),
    );
    let (kept, _) = store.write_batch(None, |ctx| ctx.write_object(employee(1, "a"))).0;
    let (dropped, _) = store.write_batch(None, |ctx| ctx.write_object(employee(2, "b"))).0;
    let layer = store.open_layer();
    let (layered, _) = store.write_batch(Some(layer), |ctx| ctx.write_object(employee(3, "c"))).0;

    let guard = store.retain(&kept);
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(store.gc(), 1);
    assert!(store.read(&kept).is_some());
    assert!(store.read(&dropped).is_none());
    assert!(store.read(&layered).is_some());

    drop(guard);
    assert_eq!(store.gc(), 0);
    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(store.gc(), 1);
    assert!(store.read(&kept).is_none());
  }
}
