//! Object set queries and push-stream consumption.

use futures::StreamExt;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::list::{CollectionKind, CollectionQuery, CollectionSpec};
use crate::cache::{BatchOptions, CacheKeyParams, DerivedPropertyNames, OrderBy, Store, WhereClause};
use crate::error::Result;
use crate::ontology::ObjectSetDefinition;

/// Options for [`Store::object_set_query`]. Stages apply in field order:
/// derived properties, filter, set operations, then the pivot.
#[derive(Debug, Clone)]
pub struct ObjectSetOptions {
  pub base: ObjectSetDefinition,
  pub where_clause: WhereClause,
  pub order_by: OrderBy,
  pub with_properties: BTreeMap<String, Value>,
  pub union: Vec<ObjectSetDefinition>,
  pub intersect: Vec<ObjectSetDefinition>,
  pub subtract: Vec<ObjectSetDefinition>,
  pub pivot_to: Option<String>,
  pub page_size: Option<usize>,
  pub streaming: bool,
}

impl ObjectSetOptions {
  pub fn new(base: ObjectSetDefinition) -> Self {
    Self {
      base,
      where_clause: WhereClause::default(),
      order_by: OrderBy::default(),
      with_properties: BTreeMap::new(),
      union: Vec::new(),
      intersect: Vec::new(),
      subtract: Vec::new(),
      pivot_to: None,
      page_size: None,
      streaming: false,
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

  pub fn union(mut self, other: ObjectSetDefinition) -> Self {
    self.union.push(other);
    self
  }

  pub fn intersect(mut self, other: ObjectSetDefinition) -> Self {
    self.intersect.push(other);
    self
  }

  pub fn subtract(mut self, other: ObjectSetDefinition) -> Self {
    self.subtract.push(other);
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

fn wire_strings(sets: &[ObjectSetDefinition]) -> Vec<String> {
  sets.iter().map(ObjectSetDefinition::to_wire_string).collect()
}

impl Store {
  /// The query for an arbitrary object set, created on first use.
  pub fn object_set_query(&self, options: ObjectSetOptions) -> Result<Arc<CollectionQuery>> {
    let where_clause = self.canonical_where(options.where_clause);
    let order_by = self.canonical_order_by(options.order_by);
    let derived = (!options.with_properties.is_empty())
      .then(|| self.canonical_derived(DerivedPropertyNames::of(&options.with_properties)));

    let key = self.cache_keys().get(CacheKeyParams::ObjectSet {
      base: options.base.to_wire_string(),
      where_clause: where_clause.clone(),
      order_by: order_by.clone(),
      derived,
      union: wire_strings(&options.union),
      intersect: wire_strings(&options.intersect),
      subtract: wire_strings(&options.subtract),
      pivot_to: options.pivot_to.clone(),
    });

    let base_type = options.base.static_result_type().map(String::from);
    let mut object_set = options
      .base
      .with_properties(options.with_properties)
      .filter((*where_clause).clone())
      .union(options.union)
      .intersect(options.intersect)
      .subtract(options.subtract);
    if let Some(link) = &options.pivot_to {
      object_set = object_set.search_around(link.clone());
    }

    let (result_type, pivot) = match (options.pivot_to, base_type) {
      (None, _) => (object_set.static_result_type().map(String::from), None),
      (Some(link), Some(source)) => (None, Some((source, link))),
      // source type unknown up front; taken from the first page instead
      (Some(_), None) => (None, None),
    };

    let spec = CollectionSpec {
      kind: CollectionKind::ObjectSet,
      object_set,
      where_clause,
      order_by,
      result_type,
      pivot,
      page_size: options.page_size,
      streaming: options.streaming,
    };
    self.collection_query(&key, spec)
  }
}

impl CollectionQuery {
  /// Subscribe to the remote push stream for this set. Returns `None` when
  /// the data source has no streaming support.
  pub(super) fn start_stream(self: &Arc<Self>, store: &Store) -> Option<JoinHandle<()>> {
    let mut stream = match store.remote().subscribe_object_set(self.object_set()) {
      Ok(stream) => stream,
      Err(e) => {
        warn!(key = %self.core().key(), error = %e, "object set streaming unavailable");
        return None;
      }
    };
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let query = Arc::downgrade(self);
    Some(handle.spawn(async move {
      while let Some(update) = stream.next().await {
        let Some(query) = query.upgrade() else {
          break;
        };
        let Ok(store) = query.core().store() else {
          break;
        };
        store.batch(BatchOptions::default(), |ctx| query.apply_update(ctx, update));
      }
      debug!("object set stream ended");
    }))
  }
}
