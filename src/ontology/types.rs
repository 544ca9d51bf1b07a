//! Domain types shared by the cache and the remote collaborator.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::cache::{OrderBy, WhereClause};
use crate::error::{Result, SyncError};

/// Primary key of an ontology object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
  Integer(i64),
  String(String),
}

impl PrimaryKey {
  /// Read a primary key out of a JSON value (strings and integers only).
  pub fn from_json(value: &Value) -> Result<Self> {
    match value {
      Value::String(s) => Ok(PrimaryKey::String(s.clone())),
      Value::Number(n) => n
        .as_i64()
        .map(PrimaryKey::Integer)
        .ok_or_else(|| SyncError::InvalidPrimaryKey(n.to_string())),
      other => Err(SyncError::InvalidPrimaryKey(other.to_string())),
    }
  }

  pub fn to_json(&self) -> Value {
    match self {
      PrimaryKey::Integer(i) => Value::from(*i),
      PrimaryKey::String(s) => Value::String(s.clone()),
    }
  }

  /// Parse a key typed on the command line: integers stay integers.
  pub fn parse_lenient(s: &str) -> Self {
    s.parse::<i64>()
      .map(PrimaryKey::Integer)
      .unwrap_or_else(|_| PrimaryKey::String(s.to_string()))
  }
}

impl fmt::Display for PrimaryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      PrimaryKey::Integer(i) => write!(f, "{}", i),
      PrimaryKey::String(s) => f.write_str(s),
    }
  }
}

impl From<i64> for PrimaryKey {
  fn from(v: i64) -> Self {
    PrimaryKey::Integer(v)
  }
}

impl From<&str> for PrimaryKey {
  fn from(v: &str) -> Self {
    PrimaryKey::String(v.to_string())
  }
}

impl From<String> for PrimaryKey {
  fn from(v: String) -> Self {
    PrimaryKey::String(v)
  }
}

/// Materialized remote entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectData {
  pub object_type: String,
  pub primary_key: PrimaryKey,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub rid: Option<String>,
  #[serde(default)]
  pub properties: Map<String, Value>,
}

/// Shared handle to an [`ObjectData`].
///
/// The cache hands out one holder per (type, primary key) for as long as the
/// data stays equal, so callers may compare holders with [`ObjectHolder::ptr_eq`].
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectHolder(Arc<ObjectData>);

impl ObjectHolder {
  pub fn new(data: ObjectData) -> Self {
    ObjectHolder(Arc::new(data))
  }

  /// Reference identity, not structural equality.
  pub fn ptr_eq(a: &ObjectHolder, b: &ObjectHolder) -> bool {
    Arc::ptr_eq(&a.0, &b.0)
  }

  pub fn property(&self, name: &str) -> Option<&Value> {
    self.0.properties.get(name)
  }

  /// Copy of the data with `properties` merged over the current values.
  pub fn with_properties(&self, properties: Map<String, Value>) -> ObjectHolder {
    let mut data = (*self.0).clone();
    for (k, v) in properties {
      data.properties.insert(k, v);
    }
    ObjectHolder::new(data)
  }

  pub fn locator(&self) -> ObjectLocator {
    ObjectLocator {
      object_type: self.0.object_type.clone(),
      primary_key: self.0.primary_key.clone(),
    }
  }
}

impl Deref for ObjectHolder {
  type Target = ObjectData;

  fn deref(&self) -> &ObjectData {
    &self.0
  }
}

impl From<ObjectData> for ObjectHolder {
  fn from(data: ObjectData) -> Self {
    ObjectHolder::new(data)
  }
}

/// (type, primary key) address of an object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectLocator {
  pub object_type: String,
  pub primary_key: PrimaryKey,
}

impl ObjectLocator {
  pub fn new(object_type: impl Into<String>, primary_key: impl Into<PrimaryKey>) -> Self {
    Self {
      object_type: object_type.into(),
      primary_key: primary_key.into(),
    }
  }
}

/// Outgoing link of an object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkMetadata {
  pub target_type: String,
  #[serde(default)]
  pub many: bool,
}

/// The parts of object type metadata the cache needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectTypeMetadata {
  pub api_name: String,
  /// Name of the property holding the primary key.
  pub primary_key: String,
  #[serde(default)]
  pub links: BTreeMap<String, LinkMetadata>,
}

/// Lazily described set of objects, in the shape sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ObjectSetDefinition {
  #[serde(rename_all = "camelCase")]
  Base { object_type: String },
  #[serde(rename_all = "camelCase")]
  Filter {
    object_set: Box<ObjectSetDefinition>,
    #[serde(rename = "where")]
    where_clause: WhereClause,
  },
  #[serde(rename_all = "camelCase")]
  Union { object_sets: Vec<ObjectSetDefinition> },
  #[serde(rename_all = "camelCase")]
  Intersect { object_sets: Vec<ObjectSetDefinition> },
  #[serde(rename_all = "camelCase")]
  Subtract { object_sets: Vec<ObjectSetDefinition> },
  #[serde(rename_all = "camelCase")]
  SearchAround {
    object_set: Box<ObjectSetDefinition>,
    link: String,
  },
  #[serde(rename_all = "camelCase")]
  WithProperties {
    object_set: Box<ObjectSetDefinition>,
    derived_properties: BTreeMap<String, Value>,
  },
}

impl ObjectSetDefinition {
  pub fn base(object_type: impl Into<String>) -> Self {
    ObjectSetDefinition::Base {
      object_type: object_type.into(),
    }
  }

  /// Empty where clauses leave the set untouched.
  pub fn filter(self, where_clause: WhereClause) -> Self {
    if where_clause.is_empty() {
      return self;
    }
    ObjectSetDefinition::Filter {
      object_set: Box::new(self),
      where_clause,
    }
  }

  pub fn search_around(self, link: impl Into<String>) -> Self {
    ObjectSetDefinition::SearchAround {
      object_set: Box::new(self),
      link: link.into(),
    }
  }

  pub fn with_properties(self, derived_properties: BTreeMap<String, Value>) -> Self {
    if derived_properties.is_empty() {
      return self;
    }
    ObjectSetDefinition::WithProperties {
      object_set: Box::new(self),
      derived_properties,
    }
  }

  pub fn union(self, others: Vec<ObjectSetDefinition>) -> Self {
    Self::set_op(self, others, |object_sets| ObjectSetDefinition::Union { object_sets })
  }

  pub fn intersect(self, others: Vec<ObjectSetDefinition>) -> Self {
    Self::set_op(self, others, |object_sets| ObjectSetDefinition::Intersect { object_sets })
  }

  pub fn subtract(self, others: Vec<ObjectSetDefinition>) -> Self {
    Self::set_op(self, others, |object_sets| ObjectSetDefinition::Subtract { object_sets })
  }

  fn set_op(
    first: ObjectSetDefinition,
    others: Vec<ObjectSetDefinition>,
    make: impl FnOnce(Vec<ObjectSetDefinition>) -> ObjectSetDefinition,
  ) -> Self {
    if others.is_empty() {
      return first;
    }
    let mut object_sets = Vec::with_capacity(others.len() + 1);
    object_sets.push(first);
    object_sets.extend(others);
    make(object_sets)
  }

  /// Serialized wire form. Maps serialize with sorted keys, so structurally
  /// equal definitions produce identical strings.
  pub fn to_wire_string(&self) -> String {
    serde_json::to_string(self).unwrap_or_default()
  }

  /// Result type when it can be known without metadata (no search-around).
  pub fn static_result_type(&self) -> Option<&str> {
    match self {
      ObjectSetDefinition::Base { object_type } => Some(object_type),
      ObjectSetDefinition::Filter { object_set, .. }
      | ObjectSetDefinition::WithProperties { object_set, .. } => object_set.static_result_type(),
      ObjectSetDefinition::Union { object_sets }
      | ObjectSetDefinition::Intersect { object_sets }
      | ObjectSetDefinition::Subtract { object_sets } => {
        object_sets.first().and_then(|os| os.static_result_type())
      }
      ObjectSetDefinition::SearchAround { .. } => None,
    }
  }

  /// Every object type named by a base set anywhere in the tree.
  pub fn referenced_types(&self) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    self.collect_types(&mut out);
    out
  }

  fn collect_types(&self, out: &mut BTreeSet<String>) {
    match self {
      ObjectSetDefinition::Base { object_type } => {
        out.insert(object_type.clone());
      }
      ObjectSetDefinition::Filter { object_set, .. }
      | ObjectSetDefinition::WithProperties { object_set, .. }
      | ObjectSetDefinition::SearchAround { object_set, .. } => object_set.collect_types(out),
      ObjectSetDefinition::Union { object_sets }
      | ObjectSetDefinition::Intersect { object_sets }
      | ObjectSetDefinition::Subtract { object_sets } => {
        for os in object_sets {
          os.collect_types(out);
        }
      }
    }
  }
}

/// Paging parameters for `fetch_page`.
#[derive(Debug, Clone, Default)]
pub struct PageRequest {
  pub page_token: Option<String>,
  pub page_size: Option<usize>,
  pub order_by: Option<OrderBy>,
}

/// One page of objects.
#[derive(Debug, Clone, Default)]
pub struct PageResult {
  pub data: Vec<ObjectHolder>,
  pub next_page_token: Option<String>,
  pub total_count: Option<u64>,
}

/// What a remote mutation reports back.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActionEditResponse {
  /// Explicit object identities.
  Edits {
    added_objects: Vec<ObjectLocator>,
    modified_objects: Vec<ObjectLocator>,
    deleted_objects: Vec<ObjectLocator>,
  },
  /// Only the types that were touched.
  ObjectTypes { edited_object_types: Vec<String> },
  /// Nothing reported.
  #[default]
  None,
}

/// Push update from a streaming object set subscription.
#[derive(Debug, Clone)]
pub enum ObjectSetUpdate {
  AddedOrUpdated(ObjectHolder),
  Removed(ObjectLocator),
}
