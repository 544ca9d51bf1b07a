//! Serde types matching the Ontologies v2 REST API, and conversions between
//! them and the cache's domain types.
//!
//! Domain types stay free of wire details; everything shaped by the service
//! (the `__`-prefixed object fields, the search-query filter form, the tagged
//! action edit responses) lives here.

use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::types::{
  ActionEditResponse, LinkMetadata, ObjectData, ObjectLocator, ObjectSetDefinition, ObjectTypeMetadata, PageRequest,
  PrimaryKey,
};
use crate::cache::{Direction, OrderBy, PropertyFilter, WhereClause};
use crate::error::RemoteError;

// ============================================================================
// Requests
// ============================================================================

/// Encode a where clause in the v2 search-query form.
pub fn search_json(clause: &WhereClause) -> Value {
  match clause {
    WhereClause::Properties(props) => {
      let mut parts: Vec<Value> = props
        .iter()
        .flat_map(|(field, filter)| property_json(field, filter))
        .collect();
      match parts.len() {
        1 => parts.remove(0),
        _ => json!({ "type": "and", "value": parts }),
      }
    }
    WhereClause::And(children) => json!({ "type": "and", "value": children.iter().map(search_json).collect::<Vec<_>>() }),
    WhereClause::Or(children) => json!({ "type": "or", "value": children.iter().map(search_json).collect::<Vec<_>>() }),
    WhereClause::Not(inner) => json!({ "type": "not", "value": search_json(inner) }),
  }
}

fn property_json(field: &str, filter: &PropertyFilter) -> Vec<Value> {
  match filter {
    PropertyFilter::Literal(Value::Null) => vec![json!({ "type": "isNull", "field": field, "value": true })],
    PropertyFilter::Literal(v) => vec![json!({ "type": "eq", "field": field, "value": v })],
    PropertyFilter::Operators(ops) => ops.iter().map(|(op, arg)| operator_json(field, op, arg)).collect(),
  }
}

fn operator_json(field: &str, op: &str, arg: &Value) -> Value {
  match op {
    "$ne" => json!({ "type": "not", "value": { "type": "eq", "field": field, "value": arg } }),
    "$isNull" => json!({ "type": "isNull", "field": field, "value": arg }),
    // the remaining operators share their name with the search type
    other => json!({ "type": other.trim_start_matches('$'), "field": field, "value": arg }),
  }
}

/// Encode an object set definition in the v2 form.
pub fn object_set_json(object_set: &ObjectSetDefinition) -> Value {
  match object_set {
    ObjectSetDefinition::Base { object_type } => json!({ "type": "base", "objectType": object_type }),
    ObjectSetDefinition::Filter {
      object_set,
      where_clause,
    } => json!({
      "type": "filter",
      "objectSet": object_set_json(object_set),
      "where": search_json(where_clause),
    }),
    ObjectSetDefinition::Union { object_sets } => set_op_json("union", object_sets),
    ObjectSetDefinition::Intersect { object_sets } => set_op_json("intersect", object_sets),
    ObjectSetDefinition::Subtract { object_sets } => set_op_json("subtract", object_sets),
    ObjectSetDefinition::SearchAround { object_set, link } => json!({
      "type": "searchAround",
      "objectSet": object_set_json(object_set),
      "link": link,
    }),
    ObjectSetDefinition::WithProperties {
      object_set,
      derived_properties,
    } => json!({
      "type": "withProperties",
      "objectSet": object_set_json(object_set),
      "derivedProperties": derived_properties,
    }),
  }
}

fn set_op_json(kind: &str, object_sets: &[ObjectSetDefinition]) -> Value {
  json!({ "type": kind, "objectSets": object_sets.iter().map(object_set_json).collect::<Vec<_>>() })
}

fn order_by_json(order_by: &OrderBy) -> Value {
  let fields: Vec<Value> = order_by
    .0
    .iter()
    .map(|f| {
      let direction = match f.direction {
        Direction::Asc => "asc",
        Direction::Desc => "desc",
      };
      json!({ "field": f.field, "direction": direction })
    })
    .collect();
  json!({ "fields": fields })
}

/// Body of `objectSets/loadObjects`.
pub fn load_objects_body(object_set: &ObjectSetDefinition, request: &PageRequest) -> Value {
  let mut body = Map::new();
  body.insert("objectSet".into(), object_set_json(object_set));
  if let Some(size) = request.page_size {
    body.insert("pageSize".into(), json!(size));
  }
  if let Some(token) = &request.page_token {
    body.insert("pageToken".into(), json!(token));
  }
  if let Some(order_by) = request.order_by.as_ref().filter(|o| !o.is_empty()) {
    body.insert("orderBy".into(), order_by_json(order_by));
  }
  Value::Object(body)
}

/// Body of `objectSets/aggregate`: the caller's spec plus the object set.
pub fn aggregate_body(object_set: &ObjectSetDefinition, spec: &Value) -> Value {
  let mut body = spec.as_object().cloned().unwrap_or_default();
  body.insert("objectSet".into(), object_set_json(object_set));
  Value::Object(body)
}

// ============================================================================
// Responses
// ============================================================================

/// An object as the service returns it: properties plus `__` metadata.
#[derive(Debug, Deserialize)]
#[serde(transparent)]
pub struct ApiObject(pub Map<String, Value>);

impl ApiObject {
  /// `object_type` is used when the payload does not name its type.
  pub fn into_object_data(self, object_type: Option<&str>) -> Result<ObjectData, RemoteError> {
    let mut fields = self.0;
    let api_name = match fields.remove("__apiName") {
      Some(Value::String(name)) => name,
      _ => object_type
        .map(String::from)
        .ok_or_else(|| RemoteError::Decode("object without __apiName".into()))?,
    };
    let primary_key = fields
      .remove("__primaryKey")
      .ok_or_else(|| RemoteError::Decode(format!("{} object without __primaryKey", api_name)))
      .and_then(|v| PrimaryKey::from_json(&v).map_err(|e| RemoteError::Decode(e.to_string())))?;
    let rid = fields.remove("__rid").and_then(|v| v.as_str().map(String::from));
    let title = fields.remove("__title").and_then(|v| match v {
      Value::String(s) => Some(s),
      Value::Null => None,
      other => Some(other.to_string()),
    });
    fields.retain(|k, _| !k.starts_with("__"));

    Ok(ObjectData {
      object_type: api_name,
      primary_key,
      title,
      rid,
      properties: fields,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLoadObjectsResponse {
  #[serde(default)]
  pub data: Vec<ApiObject>,
  pub next_page_token: Option<String>,
  pub total_count: Option<Value>,
}

impl ApiLoadObjectsResponse {
  /// Counts arrive as strings for large values.
  pub fn total_count(&self) -> Option<u64> {
    match &self.total_count {
      Some(Value::Number(n)) => n.as_u64(),
      Some(Value::String(s)) => s.parse().ok(),
      _ => None,
    }
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiObjectLocator {
  pub object_type: String,
  pub primary_key: Value,
}

impl ApiObjectLocator {
  fn into_locator(self) -> Result<ObjectLocator, RemoteError> {
    let primary_key = PrimaryKey::from_json(&self.primary_key).map_err(|e| RemoteError::Decode(e.to_string()))?;
    Ok(ObjectLocator::new(self.object_type, primary_key))
  }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ApiActionEdits {
  #[serde(rename_all = "camelCase")]
  Edits {
    #[serde(default)]
    added_objects: Vec<ApiObjectLocator>,
    #[serde(default)]
    modified_objects: Vec<ApiObjectLocator>,
    #[serde(default)]
    deleted_objects: Vec<ApiObjectLocator>,
  },
  #[serde(rename_all = "camelCase")]
  LargeScaleEdits {
    #[serde(default)]
    edited_object_types: Vec<String>,
  },
}

#[derive(Debug, Deserialize)]
pub struct ApiApplyActionResponse {
  pub edits: Option<ApiActionEdits>,
}

impl TryFrom<ApiApplyActionResponse> for ActionEditResponse {
  type Error = RemoteError;

  fn try_from(r: ApiApplyActionResponse) -> Result<Self, RemoteError> {
    let locators = |v: Vec<ApiObjectLocator>| {
      v.into_iter()
        .map(ApiObjectLocator::into_locator)
        .collect::<Result<Vec<_>, _>>()
    };
    Ok(match r.edits {
      Some(ApiActionEdits::Edits {
        added_objects,
        modified_objects,
        deleted_objects,
      }) => ActionEditResponse::Edits {
        added_objects: locators(added_objects)?,
        modified_objects: locators(modified_objects)?,
        deleted_objects: locators(deleted_objects)?,
      },
      Some(ApiActionEdits::LargeScaleEdits { edited_object_types }) => {
        ActionEditResponse::ObjectTypes { edited_object_types }
      }
      None => ActionEditResponse::None,
    })
  }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiObjectType {
  pub api_name: String,
  pub primary_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiLinkType {
  pub api_name: String,
  pub object_type_api_name: String,
  #[serde(default)]
  pub cardinality: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiFullMetadata {
  pub object_type: ApiObjectType,
  #[serde(default)]
  pub link_types: Vec<ApiLinkType>,
}

impl From<ApiFullMetadata> for ObjectTypeMetadata {
  fn from(m: ApiFullMetadata) -> Self {
    let links: BTreeMap<String, LinkMetadata> = m
      .link_types
      .into_iter()
      .map(|l| {
        (
          l.api_name,
          LinkMetadata {
            target_type: l.object_type_api_name,
            many: l.cardinality.eq_ignore_ascii_case("MANY"),
          },
        )
      })
      .collect();
    ObjectTypeMetadata {
      api_name: m.object_type.api_name,
      primary_key: m.object_type.primary_key,
      links,
    }
  }
}

#[derive(Debug, Deserialize)]
pub struct ApiFunctionResponse {
  pub value: Value,
}
