//! Sort orders for collection queries.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;

use super::canonical::Canonicalize;
use super::where_clause::compare_json;
use crate::ontology::ObjectData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
  #[default]
  Asc,
  Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SortField {
  pub field: String,
  #[serde(default)]
  pub direction: Direction,
}

/// Ordered list of sort fields. Earlier fields take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderBy(pub Vec<SortField>);

impl OrderBy {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn asc(mut self, field: impl Into<String>) -> Self {
    self.0.push(SortField {
      field: field.into(),
      direction: Direction::Asc,
    });
    self
  }

  pub fn desc(mut self, field: impl Into<String>) -> Self {
    self.0.push(SortField {
      field: field.into(),
      direction: Direction::Desc,
    });
    self
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// Compare two objects. Missing or incomparable values sort last; ties fall
  /// back to the primary key so the order is total.
  pub fn compare(&self, a: &ObjectData, b: &ObjectData) -> Ordering {
    for SortField { field, direction } in &self.0 {
      let ord = match (a.properties.get(field), b.properties.get(field)) {
        (Some(x), Some(y)) if !x.is_null() && !y.is_null() => {
          let ord = compare_json(x, y).unwrap_or(Ordering::Equal);
          match direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
          }
        }
        (Some(x), _) if !x.is_null() => Ordering::Less,
        (_, Some(y)) if !y.is_null() => Ordering::Greater,
        _ => Ordering::Equal,
      };
      if ord != Ordering::Equal {
        return ord;
      }
    }
    a.primary_key.cmp(&b.primary_key)
  }
}

impl Canonicalize for OrderBy {
  /// A field repeated later in the list can never break a tie, so only its
  /// first occurrence is kept.
  fn normalize(&self) -> Self {
    let mut seen = HashSet::new();
    OrderBy(
      self
        .0
        .iter()
        .filter(|f| seen.insert(f.field.clone()))
        .cloned()
        .collect(),
    )
  }

  fn bucket_path(&self) -> Vec<String> {
    self.0.iter().map(|f| f.field.clone()).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::canonical::{Canonical, Canonicalizer};
  use crate::ontology::PrimaryKey;
  use serde_json::json;

  fn obj(pk: i64, props: serde_json::Value) -> ObjectData {
    ObjectData {
      object_type: "Employee".into(),
      primary_key: PrimaryKey::Integer(pk),
      title: None,
      rid: None,
      properties: props.as_object().cloned().unwrap_or_default(),
    }
  }

  #[test]
  fn test_canonical_order_by() {
    let c = Canonicalizer::new();
    let a = c.canonicalize(OrderBy::new().asc("name").desc("age"));
    let b = c.canonicalize(OrderBy::new().asc("name").desc("age").asc("name"));
    assert!(Canonical::ptr_eq(&a, &b));

    let flipped = c.canonicalize(OrderBy::new().desc("age").asc("name"));
    assert!(!Canonical::ptr_eq(&a, &flipped));
  }

  #[test]
  fn test_compare() {
    let order = OrderBy::new().desc("age").asc("name");
    let mut objs = vec![
      obj(1, json!({"name": "b", "age": 30})),
      obj(2, json!({"name": "a", "age": 30})),
      obj(3, json!({"name": "c"})),
      obj(4, json!({"name": "d", "age": 41})),
    ];
    objs.sort_by(|a, b| order.compare(a, b));
    let pks: Vec<_> = objs.iter().map(|o| o.primary_key.clone()).collect();
    assert_eq!(
      pks,
      vec![
        PrimaryKey::Integer(4),
        PrimaryKey::Integer(2),
        PrimaryKey::Integer(1),
        PrimaryKey::Integer(3)
      ]
    );
  }

  #[test]
  fn test_serde_shape() {
    let order: OrderBy =
      serde_json::from_value(json!([{"field": "age", "direction": "desc"}, {"field": "name"}]))
        .expect("order by");
    assert_eq!(order, OrderBy::new().desc("age").asc("name"));
  }
}
