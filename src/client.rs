//! The public entry point: one store, its queries and action application.

use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::actions::{ActionApplication, ApplyActionOptions};
use crate::cache::{BatchContext, BatchOptions, Store};
use crate::config::StoreConfig;
use crate::error::Result;
use crate::ontology::{ActionEditResponse, ObjectLocator, PrimaryKey, RemoteDataSource};
use crate::query::{
  AggregationOptions, AggregationQuery, CollectionQuery, FunctionOptions, FunctionQuery, LinkOptions, ListOptions,
  ObjectQuery, ObjectSetOptions,
};

/// Cache-backed client for one remote data source.
///
/// Cloning is cheap; clones share the store.
#[derive(Clone)]
pub struct ObservableClient {
  store: Arc<Store>,
  actions: ActionApplication,
}

impl ObservableClient {
  pub fn new(remote: Arc<dyn RemoteDataSource>, config: StoreConfig) -> Self {
    let store = Store::new(remote, config);
    Self {
      actions: ActionApplication::new(store.clone()),
      store,
    }
  }

  pub fn store(&self) -> &Arc<Store> {
    &self.store
  }

  pub fn object(&self, object_type: &str, primary_key: impl Into<PrimaryKey>) -> Result<Arc<ObjectQuery>> {
    self.store.object_query(object_type, primary_key.into())
  }

  pub fn list(&self, options: ListOptions) -> Result<Arc<CollectionQuery>> {
    self.store.list_query(options)
  }

  pub fn object_set(&self, options: ObjectSetOptions) -> Result<Arc<CollectionQuery>> {
    self.store.object_set_query(options)
  }

  /// Needs the source type's metadata to resolve the link target.
  pub async fn links(&self, options: LinkOptions) -> Result<Arc<CollectionQuery>> {
    self.store.links_query(options).await
  }

  pub fn aggregation(&self, options: AggregationOptions) -> Result<Arc<AggregationQuery>> {
    self.store.aggregation_query(options)
  }

  pub fn function(&self, options: FunctionOptions) -> Result<Arc<FunctionQuery>> {
    self.store.function_query(options)
  }

  pub async fn apply_action(
    &self,
    action: &str,
    args: Value,
    options: ApplyActionOptions,
  ) -> Result<ActionEditResponse> {
    self.actions.apply_action(action, args, options).await
  }

  pub async fn validate_action(&self, action: &str, args: &Value) -> Result<Value> {
    self.actions.validate_action(action, args).await
  }

  /// Write directly to the cache in one transaction.
  pub fn batch<R>(&self, options: BatchOptions, f: impl FnOnce(&mut BatchContext<'_>) -> R) -> R {
    self.store.batch(options, f)
  }

  pub async fn invalidate_object(&self, object_type: &str, primary_key: impl Into<PrimaryKey>) -> Result<()> {
    self.store.invalidate_object(object_type, &primary_key.into()).await
  }

  pub async fn invalidate_object_type(&self, object_type: &str) -> Result<()> {
    self.store.invalidate_object_type(object_type, None).await
  }

  /// Refetch everything currently being observed.
  pub async fn invalidate_all(&self) -> Result<()> {
    self.store.invalidate_all().await
  }

  /// Rerun a function's live queries; `params` narrows it to one call.
  pub async fn invalidate_function(&self, api_name: &str, params: Option<&Value>) -> Result<()> {
    self.store.invalidate_function(api_name, params).await
  }

  pub async fn invalidate_functions_by_object(
    &self,
    object_type: &str,
    primary_key: impl Into<PrimaryKey>,
  ) -> Result<()> {
    self
      .store
      .invalidate_functions_by_object(&ObjectLocator::new(object_type, primary_key.into()))
      .await
  }

  /// Collect unreferenced cache keys in the background until the store is
  /// dropped.
  pub fn spawn_gc(&self) -> JoinHandle<()> {
    self.store.spawn_gc()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::WhereClause;
  use crate::test_utils::{employee, MockDataSource, Request};
  use serde_json::json;

  fn client() -> (Arc<MockDataSource>, ObservableClient) {
    let mock = Arc::new(MockDataSource::new());
    mock.insert(employee(1, "Ada"));
    mock.insert(employee(2, "Bob"));
    (mock.clone(), ObservableClient::new(mock, StoreConfig::default()))
  }

  #[tokio::test(start_paused = true)]
  async fn test_list_and_object_share_holders() {
    let (_, client) = client();
    let list = client
      .list(ListOptions::new("Employee").filter(WhereClause::eq("name", "Ada")))
      .expect("list");
    let found = list.fetch().await.expect("fetch");
    assert_eq!(found.len(), 1);

    let ada = client.object("Employee", 1).expect("query").current().expect("cached");
    assert!(crate::ontology::ObjectHolder::ptr_eq(&ada, &found[0]));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_object_refetches() {
    let (mock, client) = client();
    let query = client.object("Employee", 2).expect("query");
    query.fetch().await.expect("bob");
    mock.insert(employee(2, "Robert"));

    client.invalidate_object("Employee", 2).await.expect("invalidate");
    assert_eq!(
      query.current().expect("current").property("name"),
      Some(&json!("Robert"))
    );
    let fetches = mock
      .requests()
      .iter()
      .filter(|r| matches!(r, Request::FetchPage { .. } | Request::FetchObject(..)))
      .count();
    assert_eq!(fetches, 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_unknown_object_is_noop() {
    let (mock, client) = client();
    client.invalidate_object("Employee", 9).await.expect("invalidate");
    assert!(mock.requests().is_empty());
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_all_refetches_observed_queries() {
    let (mock, client) = client();
    let list = client.list(ListOptions::new("Employee")).expect("list");
    list.fetch().await.expect("fetch");
    let bob = client.object("Employee", 2).expect("query");
    bob.fetch().await.expect("bob");

    mock.insert(employee(2, "Robert"));
    mock.insert(employee(3, "Cy"));
    client.invalidate_all().await.expect("invalidate");

    assert_eq!(list.current().expect("list").len(), 3);
    assert_eq!(bob.current().expect("current").property("name"), Some(&json!("Robert")));
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_functions_from_client() {
    let (mock, client) = client();
    mock.set_function("headcount", json!(2));
    let query = client
      .function(FunctionOptions::new("headcount", json!({})).depends_on_object(ObjectLocator::new("Employee", 1)))
      .expect("query");
    assert_eq!(*query.fetch().await.expect("result"), json!(2));

    mock.set_function("headcount", json!(3));
    client.invalidate_function("headcount", None).await.expect("invalidate");
    assert_eq!(query.current().expect("current").as_deref(), Some(&json!(3)));

    mock.set_function("headcount", json!(4));
    client
      .invalidate_functions_by_object("Employee", 1)
      .await
      .expect("invalidate");
    assert_eq!(query.current().expect("current").as_deref(), Some(&json!(4)));
  }
}
