//! Cache keys: one identity object per logical cached query or entity.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, Weak};

use super::canonical::Canonical;
use super::derived::DerivedPropertyNames;
use super::order_by::OrderBy;
use super::where_clause::WhereClause;
use crate::ontology::{ObjectLocator, PrimaryKey};

/// Canonical description of what a cache key addresses.
///
/// Descriptor fields hold canonical references, so structural equality of
/// two parameter sets reduces to reference equality of their parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKeyParams {
  Object {
    object_type: String,
    primary_key: PrimaryKey,
  },
  List {
    object_type: String,
    where_clause: Canonical<WhereClause>,
    order_by: Canonical<OrderBy>,
    derived: Option<Canonical<DerivedPropertyNames>>,
    pivot_to: Option<String>,
  },
  ObjectSet {
    /// Wire form of the base object set.
    base: String,
    where_clause: Canonical<WhereClause>,
    order_by: Canonical<OrderBy>,
    derived: Option<Canonical<DerivedPropertyNames>>,
    union: Vec<String>,
    intersect: Vec<String>,
    subtract: Vec<String>,
    pivot_to: Option<String>,
  },
  Link {
    source_type: String,
    source_primary_key: PrimaryKey,
    link: String,
    where_clause: Canonical<WhereClause>,
    order_by: Canonical<OrderBy>,
  },
  Aggregation {
    object_set: String,
    where_clause: Canonical<WhereClause>,
    derived: Option<Canonical<DerivedPropertyNames>>,
    aggregate: String,
  },
  Function {
    api_name: String,
    params: String,
  },
}

impl CacheKeyParams {
  pub fn kind(&self) -> &'static str {
    match self {
      CacheKeyParams::Object { .. } => "object",
      CacheKeyParams::List { .. } => "list",
      CacheKeyParams::ObjectSet { .. } => "objectSet",
      CacheKeyParams::Link { .. } => "links",
      CacheKeyParams::Aggregation { .. } => "aggregation",
      CacheKeyParams::Function { .. } => "function",
    }
  }

  fn fingerprint(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.kind().as_bytes());
    hasher.update(b":");
    hasher.update(format!("{:?}", self).as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..12].to_string()
  }
}

#[derive(Debug)]
struct CacheKeyInner {
  params: CacheKeyParams,
  fingerprint: String,
}

/// Identity token for one cached query or entity. Compared by reference.
#[derive(Clone)]
pub struct CacheKey(Arc<CacheKeyInner>);

impl CacheKey {
  pub fn params(&self) -> &CacheKeyParams {
    &self.0.params
  }

  pub fn kind(&self) -> &'static str {
    self.0.params.kind()
  }

  pub fn fingerprint(&self) -> &str {
    &self.0.fingerprint
  }

  pub fn is_object(&self) -> bool {
    matches!(self.0.params, CacheKeyParams::Object { .. })
  }

  /// Collections hold ordered lists of object keys.
  pub fn is_collection(&self) -> bool {
    matches!(
      self.0.params,
      CacheKeyParams::List { .. } | CacheKeyParams::ObjectSet { .. } | CacheKeyParams::Link { .. }
    )
  }

  pub fn object_locator(&self) -> Option<ObjectLocator> {
    match &self.0.params {
      CacheKeyParams::Object {
        object_type,
        primary_key,
      } => Some(ObjectLocator::new(object_type.clone(), primary_key.clone())),
      _ => None,
    }
  }
}

impl PartialEq for CacheKey {
  fn eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
  fn hash<H: Hasher>(&self, state: &mut H) {
    (Arc::as_ptr(&self.0) as usize).hash(state);
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.0.params {
      CacheKeyParams::Object {
        object_type,
        primary_key,
      } => write!(f, "object:{}:{}", object_type, primary_key),
      params => write!(f, "{}:{}", params.kind(), self.0.fingerprint),
    }
  }
}

impl fmt::Debug for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "CacheKey({})", self)
  }
}

/// Interns cache keys: equal params give the same key while it is alive.
#[derive(Default)]
pub struct CacheKeys {
  registry: Mutex<HashMap<CacheKeyParams, Weak<CacheKeyInner>>>,
}

impl CacheKeys {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, params: CacheKeyParams) -> CacheKey {
    let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(existing) = registry.get(&params).and_then(Weak::upgrade) {
      return CacheKey(existing);
    }

    if registry.len() > 256 {
      registry.retain(|_, weak| weak.strong_count() > 0);
    }

    let inner = Arc::new(CacheKeyInner {
      fingerprint: params.fingerprint(),
      params: params.clone(),
    });
    registry.insert(params, Arc::downgrade(&inner));
    CacheKey(inner)
  }

  pub fn object(&self, object_type: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> CacheKey {
    self.get(CacheKeyParams::Object {
      object_type: object_type.into(),
      primary_key: primary_key.into(),
    })
  }

  pub fn object_at(&self, locator: &ObjectLocator) -> CacheKey {
    self.object(locator.object_type.clone(), locator.primary_key.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::canonical::Canonicalizer;

  #[test]
  fn test_object_keys_are_interned() {
    let keys = CacheKeys::new();
    let a = keys.object("Employee", 5);
    let b = keys.object("Employee", 5);
    let c = keys.object("Employee", "5");
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert_eq!(a.to_string(), "object:Employee:5");
    assert_eq!(a.object_locator(), Some(ObjectLocator::new("Employee", 5)));
  }

  #[test]
  fn test_list_keys_follow_canonical_parts() {
    let keys = CacheKeys::new();
    let wheres = Canonicalizer::new();
    let orders = Canonicalizer::new();
    let list = |w: WhereClause| CacheKeyParams::List {
      object_type: "Employee".into(),
      where_clause: wheres.canonicalize(w),
      order_by: orders.canonicalize(OrderBy::new()),
      derived: None,
      pivot_to: None,
    };

    let a = keys.get(list(WhereClause::eq("name", "Ada")));
    let b = keys.get(list(WhereClause::eq("name", "Ada")));
    let c = keys.get(list(WhereClause::eq("name", "Bob")));
    assert_eq!(a, b);
    assert_ne!(a, c);
    assert!(a.is_collection());
    assert_eq!(a.fingerprint().len(), 12);
  }

  #[test]
  fn test_dropped_key_is_recreated() {
    let keys = CacheKeys::new();
    let a = keys.object("Office", "nyc");
    let fingerprint = a.fingerprint().to_string();
    drop(a);
    let b = keys.object("Office", "nyc");
    assert_eq!(b.fingerprint(), fingerprint);
  }
}
