//! Queries for objects linked from one source object.

use std::sync::Arc;

use super::list::{CollectionKind, CollectionQuery, CollectionSpec};
use crate::cache::{CacheKeyParams, OrderBy, Store, WhereClause};
use crate::error::{Result, SyncError};
use crate::ontology::{ObjectSetDefinition, PrimaryKey};

/// Options for [`Store::links_query`].
#[derive(Debug, Clone)]
pub struct LinkOptions {
  pub source_type: String,
  pub source_primary_key: PrimaryKey,
  pub link: String,
  pub where_clause: WhereClause,
  pub order_by: OrderBy,
  pub page_size: Option<usize>,
}

impl LinkOptions {
  pub fn new(source_type: impl Into<String>, source_primary_key: impl Into<PrimaryKey>, link: impl Into<String>) -> Self {
    Self {
      source_type: source_type.into(),
      source_primary_key: source_primary_key.into(),
      link: link.into(),
      where_clause: WhereClause::default(),
      order_by: OrderBy::default(),
      page_size: None,
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

  pub fn page_size(mut self, page_size: usize) -> Self {
    self.page_size = Some(page_size);
    self
  }
}

impl Store {
  /// The query for one link of one source object. Needs the source type's
  /// metadata to name its primary key field and the link's target type.
  pub async fn links_query(&self, options: LinkOptions) -> Result<Arc<CollectionQuery>> {
    let metadata = self.object_metadata(&options.source_type).await?;
    let target_type = metadata
      .links
      .get(&options.link)
      .map(|l| l.target_type.clone())
      .ok_or_else(|| SyncError::UnknownLink {
        object_type: options.source_type.clone(),
        link: options.link.clone(),
      })?;

    let where_clause = self.canonical_where(options.where_clause);
    let order_by = self.canonical_order_by(options.order_by);
    let key = self.cache_keys().get(CacheKeyParams::Link {
      source_type: options.source_type.clone(),
      source_primary_key: options.source_primary_key.clone(),
      link: options.link.clone(),
      where_clause: where_clause.clone(),
      order_by: order_by.clone(),
    });

    let object_set = ObjectSetDefinition::base(options.source_type)
      .filter(WhereClause::eq(metadata.primary_key.clone(), options.source_primary_key.to_json()))
      .search_around(options.link)
      .filter((*where_clause).clone());

    let spec = CollectionSpec {
      kind: CollectionKind::Links,
      object_set,
      where_clause,
      order_by,
      result_type: Some(target_type),
      pivot: None,
      page_size: options.page_size,
      streaming: false,
    };
    self.collection_query(&key, spec)
  }
}
