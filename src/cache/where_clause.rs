//! Where clauses: parsing, normalization and local evaluation.
//!
//! The JSON form is the one callers write:
//!
//! ```text
//! { "$and": [ { "name": "Ada" }, { "age": { "$gt": 30 } } ] }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use super::canonical::Canonicalize;
use crate::error::{Result, SyncError};
use crate::ontology::ObjectData;

/// Filter applied to a single property.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyFilter {
  /// Bare literal, shorthand for `{ "$eq": literal }`.
  Literal(Value),
  /// Operator map such as `{ "$gt": 3, "$lt": 9 }`.
  Operators(BTreeMap<String, Value>),
}

impl PropertyFilter {
  fn from_json(value: &Value) -> Self {
    match value {
      Value::Object(map) if !map.is_empty() && map.keys().all(|k| k.starts_with('$')) => {
        PropertyFilter::Operators(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
      }
      other => PropertyFilter::Literal(other.clone()),
    }
  }

  fn to_json(&self) -> Value {
    match self {
      PropertyFilter::Literal(v) => v.clone(),
      PropertyFilter::Operators(ops) => {
        Value::Object(ops.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
      }
    }
  }

  fn normalize(&self) -> Self {
    match self {
      PropertyFilter::Operators(ops) if ops.len() == 1 => match ops.get("$eq") {
        Some(v) => PropertyFilter::Literal(v.clone()),
        None => self.clone(),
      },
      _ => self.clone(),
    }
  }

  fn evaluate(&self, actual: Option<&Value>) -> Option<bool> {
    let actual = actual.unwrap_or(&Value::Null);
    match self {
      PropertyFilter::Literal(expected) => Some(actual == expected),
      PropertyFilter::Operators(ops) => {
        combine_all(ops.iter().map(|(op, arg)| evaluate_operator(op, arg, actual)))
      }
    }
  }
}

fn evaluate_operator(op: &str, arg: &Value, actual: &Value) -> Option<bool> {
  match op {
    "$eq" => Some(actual == arg),
    "$ne" => Some(actual != arg),
    "$gt" => compare_json(actual, arg).map(|o| o == Ordering::Greater),
    "$gte" => compare_json(actual, arg).map(|o| o != Ordering::Less),
    "$lt" => compare_json(actual, arg).map(|o| o == Ordering::Less),
    "$lte" => compare_json(actual, arg).map(|o| o != Ordering::Greater),
    "$in" => arg.as_array().map(|values| values.contains(actual)),
    "$isNull" => arg.as_bool().map(|want| actual.is_null() == want),
    "$startsWith" => match (actual.as_str(), arg.as_str()) {
      (Some(a), Some(prefix)) => Some(a.starts_with(prefix)),
      (None, Some(_)) if actual.is_null() => Some(false),
      _ => None,
    },
    // full-text and geo operators need the server
    _ => None,
  }
}

/// Orders two JSON scalars of the same kind; `None` when they are not comparable.
pub(crate) fn compare_json(a: &Value, b: &Value) -> Option<Ordering> {
  match (a, b) {
    (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
    (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
    (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
    _ => None,
  }
}

fn combine_all(results: impl Iterator<Item = Option<bool>>) -> Option<bool> {
  let mut unknown = false;
  for r in results {
    match r {
      Some(false) => return Some(false),
      None => unknown = true,
      Some(true) => {}
    }
  }
  if unknown {
    None
  } else {
    Some(true)
  }
}

fn combine_any(results: impl Iterator<Item = Option<bool>>) -> Option<bool> {
  let mut unknown = false;
  for r in results {
    match r {
      Some(true) => return Some(true),
      None => unknown = true,
      Some(false) => {}
    }
  }
  if unknown {
    None
  } else {
    Some(false)
  }
}

/// Filter over ontology objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub enum WhereClause {
  And(Vec<WhereClause>),
  Or(Vec<WhereClause>),
  Not(Box<WhereClause>),
  /// Field name to filter; every entry must hold.
  Properties(BTreeMap<String, PropertyFilter>),
}

impl Default for WhereClause {
  fn default() -> Self {
    WhereClause::Properties(BTreeMap::new())
  }
}

impl WhereClause {
  /// Clause matching every object.
  pub fn all() -> Self {
    Self::default()
  }

  /// Shorthand for a single `field == value` clause.
  pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
    WhereClause::Properties(BTreeMap::from([(
      field.into(),
      PropertyFilter::Literal(value.into()),
    )]))
  }

  pub fn is_empty(&self) -> bool {
    matches!(self, WhereClause::Properties(m) if m.is_empty())
  }

  pub fn from_json(value: &Value) -> Result<Self> {
    let obj = value
      .as_object()
      .ok_or_else(|| SyncError::InvalidWhereClause(format!("expected an object, got {}", value)))?;

    let mut parts = Vec::new();
    let mut props = BTreeMap::new();
    for (key, v) in obj {
      match key.as_str() {
        "$and" => parts.push(WhereClause::And(Self::parse_list(v)?)),
        "$or" => parts.push(WhereClause::Or(Self::parse_list(v)?)),
        "$not" => parts.push(WhereClause::Not(Box::new(Self::from_json(v)?))),
        op if op.starts_with('$') => {
          return Err(SyncError::InvalidWhereClause(format!(
            "unknown logical operator {}",
            op
          )))
        }
        field => {
          props.insert(field.to_string(), PropertyFilter::from_json(v));
        }
      }
    }

    if parts.is_empty() {
      return Ok(WhereClause::Properties(props));
    }
    if !props.is_empty() {
      parts.push(WhereClause::Properties(props));
    }
    if parts.len() == 1 {
      if let Some(only) = parts.pop() {
        return Ok(only);
      }
    }
    Ok(WhereClause::And(parts))
  }

  fn parse_list(value: &Value) -> Result<Vec<WhereClause>> {
    value
      .as_array()
      .ok_or_else(|| SyncError::InvalidWhereClause(format!("expected an array, got {}", value)))?
      .iter()
      .map(Self::from_json)
      .collect()
  }

  pub fn to_json(&self) -> Value {
    match self {
      WhereClause::Properties(props) => {
        Value::Object(props.iter().map(|(k, f)| (k.clone(), f.to_json())).collect())
      }
      WhereClause::And(children) => Self::group_json("$and", children),
      WhereClause::Or(children) => Self::group_json("$or", children),
      WhereClause::Not(inner) => {
        let mut m = Map::new();
        m.insert("$not".to_string(), inner.to_json());
        Value::Object(m)
      }
    }
  }

  fn group_json(op: &str, children: &[WhereClause]) -> Value {
    let mut m = Map::new();
    m.insert(
      op.to_string(),
      Value::Array(children.iter().map(WhereClause::to_json).collect()),
    );
    Value::Object(m)
  }

  fn sort_key(&self) -> String {
    self.to_json().to_string()
  }

  /// Evaluate against an object: `Some(true)` matches, `Some(false)` does not,
  /// `None` when an operator can only be decided by the server.
  pub fn evaluate(&self, object: &ObjectData) -> Option<bool> {
    match self {
      WhereClause::Properties(props) => combine_all(
        props
          .iter()
          .map(|(field, filter)| filter.evaluate(object.properties.get(field))),
      ),
      WhereClause::And(children) => combine_all(children.iter().map(|c| c.evaluate(object))),
      WhereClause::Or(children) => combine_any(children.iter().map(|c| c.evaluate(object))),
      WhereClause::Not(inner) => inner.evaluate(object).map(|b| !b),
    }
  }

  /// Definitely matches.
  pub fn matches_strictly(&self, object: &ObjectData) -> bool {
    self.evaluate(object) == Some(true)
  }

  /// Might match once the server has its say.
  pub fn matches_loosely(&self, object: &ObjectData) -> bool {
    self.evaluate(object) != Some(false)
  }

  fn collect_fields(&self, out: &mut BTreeSet<String>) {
    match self {
      WhereClause::Properties(props) => out.extend(props.keys().cloned()),
      WhereClause::And(children) | WhereClause::Or(children) => {
        for c in children {
          c.collect_fields(out);
        }
      }
      WhereClause::Not(inner) => inner.collect_fields(out),
    }
  }

  fn normalize_group(children: &[WhereClause], is_and: bool) -> WhereClause {
    let mut flat = Vec::with_capacity(children.len());
    for child in children {
      match child.normalize() {
        WhereClause::And(inner) if is_and => flat.extend(inner),
        WhereClause::Or(inner) if !is_and => flat.extend(inner),
        WhereClause::Properties(m) if m.is_empty() => {
          if !is_and {
            // one branch matches everything
            return WhereClause::default();
          }
        }
        other => flat.push(other),
      }
    }

    flat.sort_by_cached_key(WhereClause::sort_key);
    flat.dedup();

    if is_and {
      flat = Self::merge_disjoint_properties(flat);
    }

    match flat.len() {
      0 => WhereClause::default(),
      1 => flat.pop().unwrap_or_default(),
      _ if is_and => WhereClause::And(flat),
      _ => WhereClause::Or(flat),
    }
  }

  /// Property-only members merge into one map, but only when no field is
  /// filtered by more than one of them.
  fn merge_disjoint_properties(members: Vec<WhereClause>) -> Vec<WhereClause> {
    let mut seen = BTreeSet::new();
    let mut count = 0;
    for m in &members {
      if let WhereClause::Properties(props) = m {
        count += 1;
        for field in props.keys() {
          if !seen.insert(field.clone()) {
            return members;
          }
        }
      }
    }
    if count < 2 {
      return members;
    }

    let mut merged = BTreeMap::new();
    let mut rest = Vec::with_capacity(members.len());
    for m in members {
      match m {
        WhereClause::Properties(props) => merged.extend(props),
        other => rest.push(other),
      }
    }
    rest.push(WhereClause::Properties(merged));
    rest.sort_by_cached_key(WhereClause::sort_key);
    rest
  }
}

impl Canonicalize for WhereClause {
  fn normalize(&self) -> Self {
    match self {
      WhereClause::Properties(props) => WhereClause::Properties(
        props
          .iter()
          .map(|(k, f)| (k.clone(), f.normalize()))
          .collect(),
      ),
      WhereClause::Not(inner) => match inner.normalize() {
        WhereClause::Not(double) => *double,
        other => WhereClause::Not(Box::new(other)),
      },
      WhereClause::And(children) => Self::normalize_group(children, true),
      WhereClause::Or(children) => Self::normalize_group(children, false),
    }
  }

  fn bucket_path(&self) -> Vec<String> {
    let mut fields = BTreeSet::new();
    self.collect_fields(&mut fields);
    fields.into_iter().collect()
  }
}

impl TryFrom<Value> for WhereClause {
  type Error = SyncError;

  fn try_from(value: Value) -> Result<Self> {
    WhereClause::from_json(&value)
  }
}

impl From<WhereClause> for Value {
  fn from(w: WhereClause) -> Value {
    w.to_json()
  }
}
