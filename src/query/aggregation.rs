//! Aggregation queries.

use async_trait::async_trait;
use futures::future::FutureExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{spawn_revalidate, LiveQuery, QueryCore, Subscription};
use crate::cache::{
  BatchOptions, CacheKey, CacheKeyParams, CacheValue, Changes, DerivedPropertyNames, OptimisticId, Status, Store,
  WhereClause,
};
use crate::error::{Result, SyncError};
use crate::ontology::ObjectSetDefinition;

/// Options for [`Store::aggregation_query`].
#[derive(Debug, Clone)]
pub struct AggregationOptions {
  pub object_set: ObjectSetDefinition,
  pub where_clause: WhereClause,
  pub with_properties: BTreeMap<String, Value>,
  /// Aggregation body passed to the remote as is, e.g.
  /// `{"aggregation": [{"type": "count"}], "groupBy": []}`.
  pub aggregate: Value,
}

impl AggregationOptions {
  pub fn new(object_set: ObjectSetDefinition, aggregate: Value) -> Self {
    Self {
      object_set,
      where_clause: WhereClause::default(),
      with_properties: BTreeMap::new(),
      aggregate,
    }
  }

  pub fn filter(mut self, where_clause: WhereClause) -> Self {
    self.where_clause = where_clause;
    self
  }

  pub fn with_properties(mut self, derived: BTreeMap<String, Value>) -> Self {
    self.with_properties = derived;
    self
  }
}

pub struct AggregationQuery {
  core: QueryCore,
  object_set: ObjectSetDefinition,
  aggregate: Value,
  types: Vec<String>,
}

impl Store {
  pub fn aggregation_query(&self, options: AggregationOptions) -> Result<Arc<AggregationQuery>> {
    let where_clause = self.canonical_where(options.where_clause);
    let derived = (!options.with_properties.is_empty())
      .then(|| self.canonical_derived(DerivedPropertyNames::of(&options.with_properties)));
    let key = self.cache_keys().get(CacheKeyParams::Aggregation {
      object_set: options.object_set.to_wire_string(),
      where_clause: where_clause.clone(),
      derived,
      aggregate: options.aggregate.to_string(),
    });

    let object_set = options
      .object_set
      .with_properties(options.with_properties)
      .filter((*where_clause).clone());
    let types = object_set.referenced_types().into_iter().collect();
    self.get_or_create_query(&key, || AggregationQuery {
      core: QueryCore::new(self, key.clone()),
      object_set,
      aggregate: options.aggregate,
      types,
    })
  }
}

impl AggregationQuery {
  pub async fn fetch(self: &Arc<Self>) -> Result<Arc<Value>> {
    self.clone().revalidate(false).await?;
    self
      .current()?
      .ok_or_else(|| SyncError::no_such_entry(self.core.key()))
  }

  /// Last aggregation result, without fetching.
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

  fn depends_on(&self, object_type: &str) -> bool {
    self.types.iter().any(|t| t == object_type)
  }

  async fn load(self: Arc<Self>, generation: u64) -> Result<()> {
    let store = self.core.store()?;
    let key = self.core.key().clone();
    store.write_batch(None, |ctx| ctx.set_status(&key, Status::Loading, None));

    let result = store.remote().aggregate(&self.object_set, &self.aggregate).await;
    if !self.core.is_current(generation) {
      return Ok(());
    }
    match result {
      Ok(value) => {
        store.batch(BatchOptions::default(), |ctx| {
          ctx.write_value(&key, CacheValue::Aggregation(Arc::new(value)), Status::Loaded)
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
impl LiveQuery for AggregationQuery {
  fn cache_key(&self) -> &CacheKey {
    self.core.key()
  }

  async fn maybe_update_and_revalidate(
    self: Arc<Self>,
    changes: Arc<Changes>,
    optimistic_id: Option<OptimisticId>,
  ) -> Result<()> {
    // predictions are never aggregated locally
    if optimistic_id.is_some() || !self.types.iter().any(|t| changes.touches_type(t)) {
      return Ok(());
    }
    self.revalidate(false).await
  }

  async fn invalidate_object_type(self: Arc<Self>, object_type: String, changes: Option<Arc<Changes>>) -> Result<()> {
    if !self.depends_on(&object_type) || changes.is_some_and(|c| c.modified.contains(self.core.key())) {
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
