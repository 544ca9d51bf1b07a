//! Queries over remote function results.

use async_trait::async_trait;
use futures::future::{join_all, FutureExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use super::{spawn_revalidate, LiveQuery, QueryCore, Subscription};
use crate::cache::{BatchOptions, CacheKey, CacheKeyParams, CacheValue, Changes, OptimisticId, Status, Store};
use crate::error::{Result, SyncError};
use crate::ontology::ObjectLocator;

/// Options for [`Store::function_query`]. Dependencies only decide when the
/// result is recomputed; they are not part of the query identity.
#[derive(Debug, Clone)]
pub struct FunctionOptions {
  pub api_name: String,
  pub params: Value,
  /// Object types whose invalidation reruns the function.
  pub depends_on: Vec<String>,
  /// Objects whose confirmed changes rerun the function.
  pub depends_on_objects: Vec<ObjectLocator>,
}

impl FunctionOptions {
  pub fn new(api_name: impl Into<String>, params: Value) -> Self {
    Self {
      api_name: api_name.into(),
      params,
      depends_on: Vec::new(),
      depends_on_objects: Vec::new(),
    }
  }

  pub fn depends_on(mut self, object_type: impl Into<String>) -> Self {
    self.depends_on.push(object_type.into());
    self
  }

  pub fn depends_on_object(mut self, locator: ObjectLocator) -> Self {
    self.depends_on_objects.push(locator);
    self
  }
}

pub struct FunctionQuery {
  core: QueryCore,
  api_name: String,
  params: Value,
  depends_on: Vec<String>,
  depends_on_objects: Vec<CacheKey>,
}

impl Store {
  pub fn function_query(&self, options: FunctionOptions) -> Result<Arc<FunctionQuery>> {
    let key = self.cache_keys().get(CacheKeyParams::Function {
      api_name: options.api_name.clone(),
      params: options.params.to_string(),
    });
    let depends_on_objects = options
      .depends_on_objects
      .iter()
      .map(|l| self.cache_keys().object_at(l))
      .collect();
    self.get_or_create_query(&key, || FunctionQuery {
      core: QueryCore::new(self, key.clone()),
      api_name: options.api_name,
      params: options.params,
      depends_on: options.depends_on,
      depends_on_objects,
    })
  }

  /// Rerun the live queries of one function: all of them, or with `params`
  /// only the one called with exactly those parameters.
  pub async fn invalidate_function(&self, api_name: &str, params: Option<&Value>) -> Result<()> {
    info!(api_name, "invalidating function");
    let params = params.map(Value::to_string);
    let queries = self
      .queries_of::<FunctionQuery>()
      .into_iter()
      .filter(|q| q.api_name == api_name)
      .filter(|q| params.as_ref().map_or(true, |p| *p == q.params.to_string()));
    rerun(queries).await
  }

  /// Rerun every live function query declared to depend on `locator`.
  pub async fn invalidate_functions_by_object(&self, locator: &ObjectLocator) -> Result<()> {
    let key = self.cache_keys().object_at(locator);
    info!(key = %key, "invalidating functions by object");
    let queries = self
      .queries_of::<FunctionQuery>()
      .into_iter()
      .filter(|q| q.depends_on_objects.contains(&key));
    rerun(queries).await
  }
}

async fn rerun(queries: impl Iterator<Item = Arc<FunctionQuery>>) -> Result<()> {
  let results = join_all(queries.map(|q| q.revalidate(true))).await;
  results.into_iter().collect::<Result<Vec<_>>>().map(|_| ())
}

impl FunctionQuery {
  pub async fn fetch(self: &Arc<Self>) -> Result<Arc<Value>> {
    self.clone().revalidate(false).await?;
    self
      .current()?
      .ok_or_else(|| SyncError::no_such_entry(self.core.key()))
  }

  pub fn current(&self) -> Result<Option<Arc<Value>>> {
    Ok(
      self
        .core
        .store()?
        .read(self.core.key())
        .and_then(|e| e.value.as_ref().and_then(CacheValue::as_json).cloned()),
    )
  }

  pub fn subscribe(self: &Arc<Self>) -> Result<Subscription> {
    let store = self.core.store()?;
    let sub = Subscription::new(&store, self.core.key());
    spawn_revalidate(self.clone());
    Ok(sub)
  }

  async fn load(self: Arc<Self>, generation: u64) -> Result<()> {
    let store = self.core.store()?;
    let key = self.core.key().clone();
    store.write_batch(None, |ctx| ctx.set_status(&key, Status::Loading, None));

    let result = store.remote().execute_function(&self.api_name, &self.params).await;
    if !self.core.is_current(generation) {
      return Ok(());
    }
    match result {
      Ok(value) => {
        store.batch(BatchOptions::default(), |ctx| {
          ctx.write_value(&key, CacheValue::Function(Arc::new(value)), Status::Loaded)
        });
        self.core.mark_loaded();
        Ok(())
      }
      Err(e) => {
        let e = SyncError::from(e);
        store.write_batch(None, |ctx| ctx.set_status(&key, Status::Error, Some(e.clone())));
        Err(e)
      }
    }
  }
}

#[async_trait]
impl LiveQuery for FunctionQuery {
  fn cache_key(&self) -> &CacheKey {
    self.core.key()
  }

  async fn maybe_update_and_revalidate(
    self: Arc<Self>,
    changes: Arc<Changes>,
    optimistic_id: Option<OptimisticId>,
  ) -> Result<()> {
    let touched = self
      .depends_on_objects
      .iter()
      .any(|k| changes.added.contains(k) || changes.modified.contains(k));
    if optimistic_id.is_some() || !touched {
      return Ok(());
    }
    self.revalidate(false).await
  }

  async fn invalidate_object_type(self: Arc<Self>, object_type: String, changes: Option<Arc<Changes>>) -> Result<()> {
    if !self.depends_on.contains(&object_type) || changes.is_some_and(|c| c.modified.contains(self.core.key())) {
      return Ok(());
    }
    self.revalidate(true).await
  }

  async fn revalidate(self: Arc<Self>, force: bool) -> Result<()> {
    let this = self.clone();
    self
      .core
      .revalidate(force, move |generation| this.load(generation).boxed())
      .await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::StoreConfig;
  use crate::test_utils::{employee, MockDataSource, Request};
  use serde_json::json;

  fn calls(mock: &MockDataSource) -> usize {
    mock
      .requests()
      .iter()
      .filter(|r| matches!(r, Request::ExecuteFunction(..)))
      .count()
  }

  #[tokio::test(start_paused = true)]
  async fn test_function_reruns_on_dependencies() {
    let mock = Arc::new(MockDataSource::new());
    mock.set_function("headcount", json!(42));
    let store = Store::new(mock.clone(), StoreConfig::default());
    let query = store
      .function_query(
        FunctionOptions::new("headcount", json!({"office": "nyc"}))
          .depends_on("Office")
          .depends_on_object(ObjectLocator::new("Employee", 1)),
      )
      .expect("query");
    assert_eq!(*query.fetch().await.expect("result"), json!(42));
    assert_eq!(calls(&mock), 1);

    // unrelated object
    let (_, changes) = store.write_batch(None, |ctx| {
      ctx.write_object(employee(2, "Bob"));
    });
    query
      .clone()
      .maybe_update_and_revalidate(Arc::new(changes), None)
      .await
      .expect("update");
    assert_eq!(calls(&mock), 1);

    let (_, changes) = store.write_batch(None, |ctx| {
      ctx.write_object(employee(1, "Ada"));
    });
    query
      .clone()
      .maybe_update_and_revalidate(Arc::new(changes), None)
      .await
      .expect("update");
    assert_eq!(calls(&mock), 2);

    store.invalidate_object_type("Office", None).await.expect("invalidate");
    assert_eq!(calls(&mock), 3);
  }

  fn calls_with(mock: &MockDataSource, api_name: &str, params: &Value) -> usize {
    mock
      .requests()
      .iter()
      .filter(|r| matches!(r, Request::ExecuteFunction(a, p) if a == api_name && p == params))
      .count()
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_function_by_name_and_params() {
    let mock = Arc::new(MockDataSource::new());
    mock.set_function("headcount", json!(42));
    mock.set_function("payroll", json!(7));
    let store = Store::new(mock.clone(), StoreConfig::default());
    let nyc = json!({"office": "nyc"});
    let sfo = json!({"office": "sfo"});
    for (name, params) in [("headcount", &nyc), ("headcount", &sfo), ("payroll", &nyc)] {
      store
        .function_query(FunctionOptions::new(name, params.clone()))
        .expect("query")
        .fetch()
        .await
        .expect("result");
    }
    assert_eq!(calls(&mock), 3);

    store
      .invalidate_function("headcount", Some(&json!({"office": "nyc"})))
      .await
      .expect("invalidate");
    assert_eq!(calls_with(&mock, "headcount", &nyc), 2);
    assert_eq!(calls_with(&mock, "headcount", &sfo), 1);
    assert_eq!(calls(&mock), 4);

    store.invalidate_function("headcount", None).await.expect("invalidate");
    assert_eq!(calls_with(&mock, "headcount", &nyc), 3);
    assert_eq!(calls_with(&mock, "headcount", &sfo), 2);
    assert_eq!(calls_with(&mock, "payroll", &nyc), 1);

    // nothing registered under this name
    store.invalidate_function("missing", None).await.expect("invalidate");
    assert_eq!(calls(&mock), 6);
  }

  #[tokio::test(start_paused = true)]
  async fn test_invalidate_functions_by_object() {
    let mock = Arc::new(MockDataSource::new());
    mock.set_function("headcount", json!(42));
    let store = Store::new(mock.clone(), StoreConfig::default());
    let ada = json!({"who": "ada"});
    let bob = json!({"who": "bob"});
    store
      .function_query(
        FunctionOptions::new("headcount", ada.clone()).depends_on_object(ObjectLocator::new("Employee", 1)),
      )
      .expect("query")
      .fetch()
      .await
      .expect("result");
    store
      .function_query(
        FunctionOptions::new("headcount", bob.clone()).depends_on_object(ObjectLocator::new("Employee", 2)),
      )
      .expect("query")
      .fetch()
      .await
      .expect("result");

    store
      .invalidate_functions_by_object(&ObjectLocator::new("Employee", 1))
      .await
      .expect("invalidate");
    assert_eq!(calls_with(&mock, "headcount", &ada), 2);
    assert_eq!(calls_with(&mock, "headcount", &bob), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_params_key_order_does_not_matter() {
    let mock = Arc::new(MockDataSource::new());
    let store = Store::new(mock, StoreConfig::default());
    let a = store
      .function_query(FunctionOptions::new("f", json!({"a": 1, "b": 2})))
      .expect("query");
    let b = store
      .function_query(FunctionOptions::new("f", json!({"b": 2, "a": 1})))
      .expect("query");
    assert!(Arc::ptr_eq(&a, &b));
  }
}
