//! Collection queries: lists of one object type, plus the machinery shared
//! with object set and link queries.

use async_trait::async_trait;
use futures::future::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{spawn_revalidate, LiveQuery, QueryCore, Subscription};
use crate::cache::{
  BatchContext, BatchOptions, CacheKey, CacheKeyParams, Canonical, Changes, CollectionData, DerivedPropertyNames,
  OptimisticId, OrderBy, Status, Store, WhereClause,
};
use crate::error::{Result, SyncError};
use crate::ontology::{ObjectHolder, ObjectSetDefinition, ObjectSetUpdate, PageRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CollectionKind {
  /// Objects of one type; membership can be decided locally.
  List,
  /// Arbitrary object set; any confirmed change to the result type refetches.
  ObjectSet,
  /// Objects linked from one source object.
  Links,
}

/// Options for [`Store::list_query`].
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
  pub object_type: String,
  pub where_clause: WhereClause,
  pub order_by: OrderBy,
  /// Derived properties by output name.
  pub with_properties: BTreeMap<String, Value>,
  pub pivot_to: Option<String>,
  pub page_size: Option<usize>,
  pub streaming: bool,
}

impl ListOptions {
  pub fn new(object_type: impl Into<String>) -> Self {
    Self {
      object_type: object_type.into(),
      ..Self::default()
    }
  }

  pub fn filter(mut self, where_clause: WhereClause) -> Self {
    self.where_clause = where_clause;
    self
  }

  pub fn order_by(mut self, order_by: OrderBy) -> Self {
    self.order_by = order_by;
    self
  }

  pub fn with_properties(mut self, derived: BTreeMap<String, Value>) -> Self {
    self.with_properties = derived;
    self
  }

  pub fn pivot_to(mut self, link: impl Into<String>) -> Self {
    self.pivot_to = Some(link.into());
    self
  }

  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = Some(page_size);
    self
  }

  pub fn streaming(mut self, streaming: bool) -> Self {
    self.streaming = streaming;
    self
  }
}

/// Construction parameters shared by the collection helpers.
pub(crate) struct CollectionSpec {
  pub kind: CollectionKind,
  pub object_set: ObjectSetDefinition,
  pub where_clause: Canonical<WhereClause>,
  pub order_by: Canonical<OrderBy>,
  pub result_type: Option<String>,
  /// Source type and link, when the result type must come from metadata.
  pub pivot: Option<(String, String)>,
  pub page_size: Option<usize>,
  pub streaming: bool,
}

/// A paged, ordered collection of objects.
pub struct CollectionQuery {
  core: QueryCore,
  kind: CollectionKind,
  object_set: ObjectSetDefinition,
  where_clause: Canonical<WhereClause>,
  order_by: Canonical<OrderBy>,
  result_type: Mutex<Option<String>>,
  pivot: Option<(String, String)>,
  page_size: Option<usize>,
  pub(super) streaming: bool,
  next_page_token: Mutex<Option<String>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

impl Store {
  /// The query for a list of objects of one type, created on first use.
  pub fn list_query(&self, options: ListOptions) -> Result<Arc<CollectionQuery>> {
    let where_clause = self.canonical_where(options.where_clause);
    let order_by = self.canonical_order_by(options.order_by);
    let derived = (!options.with_properties.is_empty())
      .then(|| self.canonical_derived(DerivedPropertyNames::of(&options.with_properties)));

    let key = self.cache_keys().get(CacheKeyParams::List {
      object_type: options.object_type.clone(),
      where_clause: where_clause.clone(),
      order_by: order_by.clone(),
      derived,
      pivot_to: options.pivot_to.clone(),
    });

    let mut object_set = ObjectSetDefinition::base(options.object_type.clone())
      .with_properties(options.with_properties)
      .filter((*where_clause).clone());
    if let Some(link) = &options.pivot_to {
      object_set = object_set.search_around(link.clone());
    }

    let spec = CollectionSpec {
      kind: CollectionKind::List,
      object_set,
      where_clause,
      order_by,
      result_type: options.pivot_to.is_none().then(|| options.object_type.clone()),
      pivot: options.pivot_to.map(|link| (options.object_type, link)),
      page_size: options.page_size,
      streaming: options.streaming,
    };
    self.collection_query(&key, spec)
  }

  pub(crate) fn collection_query(&self, key: &CacheKey, spec: CollectionSpec) -> Result<Arc<CollectionQuery>> {
    self.get_or_create_query(key, || CollectionQuery {
      core: QueryCore::new(self, key.clone()),
      kind: spec.kind,
      object_set: spec.object_set,
      where_clause: spec.where_clause,
      order_by: spec.order_by,
      result_type: Mutex::new(spec.result_type),
      pivot: spec.pivot,
      page_size: spec.page_size,
      streaming: spec.streaming,
      next_page_token: Mutex::new(None),
    })
  }
}

impl CollectionQuery {
  pub fn object_set(&self) -> &ObjectSetDefinition {
    &self.object_set
  }

  pub fn result_type(&self) -> Option<String> {
    lock(&self.result_type).clone()
  }

  pub(super) fn core(&self) -> &QueryCore {
    &self.core
  }

  /// Load the first page (or reuse it) and return the visible members.
  pub async fn fetch(self: &Arc<Self>) -> Result<Vec<ObjectHolder>> {
    self.clone().revalidate(false).await?;
    self.current()
  }

  /// Visible members, without fetching.
  pub fn current(&self) -> Result<Vec<ObjectHolder>> {
    let store = self.core.store()?;
    Ok(
      store
        .read(self.core.key())
        .and_then(|e| e.collection().map(|c| store.resolve(c)))
        .unwrap_or_default(),
    )
  }

  pub fn has_more(&self) -> bool {
    lock(&self.next_page_token).is_some()
  }

  /// Append the next page. A no-op once the last page has been loaded.
  pub async fn fetch_more(self: &Arc<Self>) -> Result<()> {
    if !self.has_more() {
      return Ok(());
    }
    let generation = self.core.generation();
    self.clone().load_page(generation, true).await
  }

  /// Follow the collection. Starts a load (and the push stream, for
  /// streaming queries) in the background.
  pub fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
    let store = self.core.store()?;
    let mut sub = Subscription::new(&store, self.core.key());
    if self.streaming {
      if let Some(task) = self.start_stream(&store) {
        sub = sub.with_stream_task(task);
      }
    }
    spawn_revalidate(self.clone());
    Ok(sub)
  }

  async fn resolve_result_type(&self, store: &Store) -> Result<()> {
    if self.result_type().is_some() {
      return Ok(());
    }
    if let Some((source_type, link)) = &self.pivot {
      let metadata = store.object_metadata(source_type).await?;
      if let Some(target) = metadata.links.get(link) {
        *lock(&self.result_type) = Some(target.target_type.clone());
      }
    } else if let Some(static_type) = self.object_set.static_result_type() {
      *lock(&self.result_type) = Some(static_type.to_string());
    }
    Ok(())
  }

  async fn load_page(self: Arc<Self>, generation: u64, append: bool) -> Result<()> {
    let store = self.core.store()?;
    let key = self.core.key().clone();
    self.resolve_result_type(&store).await?;

    let page_token = if append {
      lock(&self.next_page_token).clone()
    } else {
      store.write_batch(None, |ctx| ctx.set_status(&key, Status::Loading, None));
      None
    };
    let request = PageRequest {
      page_token,
      page_size: self.page_size.or(store.config().page_size),
      order_by: (!self.order_by.is_empty()).then(|| (*self.order_by).clone()),
    };

    let page = match store.remote().fetch_page(&self.object_set, &request).await {
      Ok(page) => page,
      Err(e) => {
        let e = SyncError::from(e);
        store.write_batch(None, |ctx| ctx.set_status(&key, Status::Error, Some(e.clone())));
        return Err(e);
      }
    };
    if !self.core.is_current(generation) {
      return Ok(());
    }

    if self.result_type().is_none() {
      if let Some(first) = page.data.first() {
        *lock(&self.result_type) = Some(first.object_type.clone());
      }
    }

    let total_count = page.total_count;
    store.batch(BatchOptions::default(), |ctx| {
      let mut data = if append {
        ctx
          .read(&key)
          .and_then(|e| e.collection().map(|c| c.data.clone()))
          .unwrap_or_default()
      } else {
        Vec::new()
      };
      for holder in page.data {
        let (member, _) = ctx.write_object(holder);
        if !data.contains(&member) {
          data.push(member);
        }
      }
      ctx.write_collection(&key, CollectionData { data, total_count }, Status::Loaded);
    });
    *lock(&self.next_page_token) = page.next_page_token;
    self.core.mark_loaded();
    Ok(())
  }

  fn sort_members(&self, ctx: &BatchContext<'_>, data: &mut Vec<CacheKey>) {
    let mut keyed: Vec<(CacheKey, Option<ObjectHolder>)> = data
      .drain(..)
      .map(|k| {
        let holder = ctx.read(&k).and_then(|e| e.object().cloned());
        (k, holder)
      })
      .collect();
    keyed.sort_by(|(_, a), (_, b)| match (a, b) {
      (Some(a), Some(b)) => self.order_by.compare(a, b),
      (Some(_), None) => std::cmp::Ordering::Less,
      (None, Some(_)) => std::cmp::Ordering::Greater,
      (None, None) => std::cmp::Ordering::Equal,
    });
    data.extend(keyed.into_iter().map(|(k, _)| k));
  }

  /// Fold one pushed update into the member list.
  pub(super) fn apply_update(&self, ctx: &mut BatchContext<'_>, update: ObjectSetUpdate) {
    let key = self.core.key().clone();
    let entry = ctx.read(&key);
    let current = entry.as_ref().and_then(|e| e.collection().cloned()).unwrap_or_default();
    let status = entry.map(|e| e.status).unwrap_or(Status::Loaded);
    let mut data = current.data.clone();
    match update {
      ObjectSetUpdate::AddedOrUpdated(holder) => {
        let (member, _) = ctx.write_object(holder);
        if !data.contains(&member) {
          data.push(member);
        }
        if !self.order_by.is_empty() {
          self.sort_members(ctx, &mut data);
        }
      }
      ObjectSetUpdate::Removed(locator) => {
        let gone = ctx.cache_keys().object_at(&locator);
        data.retain(|m| m != &gone);
      }
    }
    ctx.write_collection(
      &key,
      CollectionData {
        data,
        total_count: current.total_count,
      },
      status,
    );
  }

  /// Apply a committed change set to the member list. Returns whether the
  /// remote must be asked because membership could not be decided locally.
  fn apply_changes(&self, ctx: &mut BatchContext<'_>, changes: &Changes, result_type: &str) -> bool {
    let key = self.core.key().clone();
    let Some(entry) = ctx.read(&key) else {
      return false;
    };
    let Some(current) = entry.collection().cloned() else {
      return false;
    };
    let optimistic = ctx.is_optimistic();
    let mut data = current.data.clone();
    let mut needs_revalidate = false;
    let mut resort = false;

    if let Some(deleted) = changes.deleted_objects.get(result_type) {
      for locator in deleted {
        let gone = ctx.cache_keys().object_at(locator);
        data.retain(|m| m != &gone);
      }
    }

    for holder in changes.objects_of_type(result_type) {
      let member = ctx
        .cache_keys()
        .object(holder.object_type.clone(), holder.primary_key.clone());
      let present = data.contains(&member);
      match self.kind {
        CollectionKind::List if self.pivot.is_none() => match self.where_clause.evaluate(holder) {
          Some(true) => {
            if !present {
              data.push(member);
            }
            resort = true;
          }
          Some(false) => {
            // a prediction never removes confirmed members
            if present && !optimistic {
              data.retain(|m| m != &member);
            }
          }
          None => needs_revalidate = true,
        },
        CollectionKind::List | CollectionKind::ObjectSet => needs_revalidate = true,
        CollectionKind::Links => {}
      }
    }

    if resort && !self.order_by.is_empty() {
      self.sort_members(ctx, &mut data);
    }
    if data != current.data {
      ctx.write_collection(
        &key,
        CollectionData {
          data,
          total_count: current.total_count,
        },
        entry.status,
      );
    }
    needs_revalidate
  }
}

#[async_trait]
impl LiveQuery for CollectionQuery {
  fn cache_key(&self) -> &CacheKey {
    self.core.key()
  }

  async fn maybe_update_and_revalidate(
    self: Arc<Self>,
    changes: Arc<Changes>,
    optimistic_id: Option<OptimisticId>,
  ) -> Result<()> {
    let Some(result_type) = self.result_type() else {
      return Ok(());
    };
    if !changes.touches_type(&result_type) {
      return Ok(());
    }
    let store = self.core.store()?;
    // the job finished and dropped its layer before this ran
    if optimistic_id.is_some_and(|id| !store.has_layer(id)) {
      return Ok(());
    }
    let needs_revalidate = store.batch(BatchOptions { optimistic_id }, |ctx| {
      self.apply_changes(ctx, &changes, &result_type)
    });
    if needs_revalidate && optimistic_id.is_none() {
      self.revalidate(false).await?;
    }
    Ok(())
  }

  async fn invalidate_object_type(self: Arc<Self>, object_type: String, changes: Option<Arc<Changes>>) -> Result<()> {
    let depends = self.result_type().as_deref() == Some(object_type.as_str())
      || self.object_set.referenced_types().contains(&object_type);
    if !depends || changes.is_some_and(|c| c.modified.contains(self.core.key())) {
      return Ok(());
    }
    self.revalidate(true).await
  }

  async fn revalidate(self: Arc<Self>, force: bool) -> Result<()> {
    let this = self.clone();
    self
      .core
      .revalidate(force, move |generation| this.load_page(generation, false).boxed())
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StoreConfig;
  use crate::test_utils::{employee, MockDataSource, Request};
  use serde_json::json;

  fn setup() -> (Arc<MockDataSource>, Arc<Store>) {
    let mock = Arc::new(MockDataSource::new());
    mock.insert(employee(1, "Ada"));
    mock.insert(employee(2, "Bob"));
    mock.insert(employee(3, "Cy"));
    let store = Store::new(mock.clone(), StoreConfig::default());
    (mock, store)
  }

  fn names(objs: &[ObjectHolder]) -> Vec<String> {
    objs
      .iter()
      .filter_map(|o| o.property("name").and_then(|v| v.as_str()).map(String::from))
      .collect()
  }

  fn w(v: Value) -> WhereClause {
    WhereClause::from_json(&v).expect("where")
  }

  #[tokio::test(start_paused = true)]
  async fn test_structurally_equal_options_share_a_query() {
    let (_, store) = setup();
    let a = store
      .list_query(ListOptions::new("Employee").filter(w(json!({"name": "Ada", "employeeId": 1}))))
      .expect("query");
    let b = store
      .list_query(ListOptions::new("Employee").filter(w(json!({"$and": [{"employeeId": {"$eq": 1}}, {"name": "Ada"}]}))))
      .expect("query");
    let c = store
      .list_query(ListOptions::new("Employee").filter(w(json!({"name": "Bob"}))))
      .expect("query");
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
  }

  #[tokio::test(start_paused = true)]
  async fn test_derived_clauses_share_by_output_names() {
    let (_, store) = setup();
    let derived = |body: Value| BTreeMap::from([("managerName".to_string(), body)]);
    let a = store
      .list_query(ListOptions::new("Employee").with_properties(derived(json!({"selectProperty": "fullName"}))))
      .expect("query");
    let b = store
      .list_query(ListOptions::new("Employee").with_properties(derived(json!({"selectProperty": "email"}))))
      .expect("query");
    let c = store
      .list_query(
        ListOptions::new("Employee")
          .with_properties(BTreeMap::from([("reportCount".to_string(), json!({"aggregate": "count"}))])),
      )
      .expect("query");
    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
  }

  #[tokio::test(start_paused = true)]
  async fn test_fetch_and_paginate() {
    let (mock, store) = setup();
    let query = store
      .list_query(ListOptions::new("Employee").order_by(OrderBy::new().asc("name")).page_size(2))
      .expect("query");

    let first = query.fetch().await.expect("page");
    assert_eq!(names(&first), vec!["Ada", "Bob"]);
    assert!(query.has_more());

    query.fetch_more().await.expect("more");
    assert_eq!(names(&query.current().expect("members")), vec!["Ada", "Bob", "Cy"]);
    assert!(!query.has_more());

    let pages = mock
      .requests()
      .into_iter()
      .filter(|r| matches!(r, Request::FetchPage { .. }))
      .count();
    assert_eq!(pages, 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_local_membership_updates() {
    let (_, store) = setup();
    let query = store
      .list_query(
        ListOptions::new("Employee")
          .filter(w(json!({"name": {"$startsWith": "A"}})))
          .order_by(OrderBy::new().asc("name")),
      )
      .expect("query");
    assert_eq!(names(&query.fetch().await.expect("list")), vec!["Ada"]);

    // a confirmed write of a matching object joins the list in order
    let (_, changes) = store.write_batch(None, |ctx| {
      ctx.write_object(employee(4, "Abe"));
      ctx.write_object(employee(1, "Zed"));
    });
    query
      .clone()
      .maybe_update_and_revalidate(Arc::new(changes), None)
      .await
      .expect("update");
    assert_eq!(names(&query.current().expect("list")), vec!["Abe"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_optimistic_changes_only_add() {
    let (_, store) = setup();
    let query = store
      .list_query(ListOptions::new("Employee").filter(w(json!({"name": {"$startsWith": "A"}}))))
      .expect("query");
    query.fetch().await.expect("list");

    let id = store.open_layer();
    let (_, changes) = store.write_batch(Some(id), |ctx| {
      ctx.write_object(employee(5, "Ann"));
      ctx.write_object(employee(1, "Xavier"));
    });
    query
      .clone()
      .maybe_update_and_revalidate(Arc::new(changes), Some(id))
      .await
      .expect("update");
    let members = query.current().expect("list");
    assert_eq!(members.len(), 2);
    assert!(store.snapshot(query.cache_key()).is_optimistic);

    store.remove_layer(id);
    assert_eq!(names(&query.current().expect("list")), vec!["Ada"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_propagation_after_layer_removal_leaves_no_layer() {
    let mock = Arc::new(MockDataSource::new());
    mock.insert(employee(1, "Ada"));
    let store = Store::new(mock.clone(), StoreConfig::default());
    let query = store.list_query(ListOptions::new("Employee")).expect("query");
    assert_eq!(query.fetch().await.expect("list").len(), 1);

    let id = store.open_layer();
    store.batch(BatchOptions::optimistic(id), |ctx| {
      ctx.write_object(employee(9, "Zed"));
    });
    store.remove_layer(id);
    // let the detached propagation run against the removed layer
    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    assert_eq!(store.layer_status(id), None);

    mock.insert(employee(2, "Bob"));
    query.clone().revalidate(true).await.expect("revalidate");
    let pks: Vec<String> = query
      .current()
      .expect("list")
      .iter()
      .map(|o| o.primary_key.to_string())
      .collect();
    assert_eq!(pks, vec!["1", "2"]);
    assert!(!store.snapshot(query.cache_key()).is_optimistic);
  }

  #[tokio::test(start_paused = true)]
  async fn test_unknown_operator_forces_refetch() {
    let (mock, store) = setup();
    let query = store
      .list_query(ListOptions::new("Employee").filter(w(json!({"name": {"$containsAnyTerm": "x"}}))))
      .expect("query");
    query.fetch().await.expect("list");
    let before = mock.requests().len();

    let (_, changes) = store.write_batch(None, |ctx| {
      ctx.write_object(employee(6, "Xena"));
    });
    query
      .clone()
      .maybe_update_and_revalidate(Arc::new(changes), None)
      .await
      .expect("update");
    assert!(mock.requests().len() > before);
  }

  #[tokio::test(start_paused = true)]
  async fn test_deleted_members_are_dropped() {
    let (_, store) = setup();
    let query = store.list_query(ListOptions::new("Employee")).expect("query");
    assert_eq!(query.fetch().await.expect("list").len(), 3);

    let (_, changes) = store.write_batch(None, |ctx| {
      ctx.delete_object(&crate::ontology::ObjectLocator::new("Employee", 2));
    });
    query
      .clone()
      .maybe_update_and_revalidate(Arc::new(changes), None)
      .await
      .expect("update");
    assert_eq!(names(&query.current().expect("list")), vec!["Ada", "Cy"]);
  }

  #[tokio::test(start_paused = true)]
  async fn test_pivot_resolves_result_type_from_metadata() {
    let (mock, store) = setup();
    mock.insert(crate::test_utils::office("nyc", "New York"));
    mock.link(("Employee", 1), "office", ("Office", "nyc"));
    let query = store
      .list_query(ListOptions::new("Employee").filter(WhereClause::eq("employeeId", 1)).pivot_to("office"))
      .expect("query");
    let offices = query.fetch().await.expect("offices");
    assert_eq!(offices.len(), 1);
    assert_eq!(query.result_type().as_deref(), Some("Office"));
  }
}
