//! In-memory remote data source for tests.

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::stream::{BoxStream, StreamExt};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::error::RemoteError;
use crate::ontology::{
  ActionEditResponse, LinkMetadata, ObjectData, ObjectHolder, ObjectLocator, ObjectSetDefinition, ObjectSetUpdate,
  ObjectTypeMetadata, PageRequest, PageResult, PrimaryKey, RemoteDataSource,
};

/// One call received by the mock, in arrival order.
#[derive(Debug, Clone)]
pub enum Request {
  Metadata(String),
  FetchObject(String, PrimaryKey),
  FetchPage {
    object_set: ObjectSetDefinition,
    page_token: Option<String>,
  },
  Aggregate {
    object_set: ObjectSetDefinition,
    spec: Value,
  },
  ApplyAction(String, Value),
  ValidateAction(String, Value),
  ExecuteFunction(String, Value),
  Subscribe(ObjectSetDefinition),
}

type ActionHandler = Arc<dyn Fn(&MockDataSource, &Value) -> Result<ActionEditResponse, RemoteError> + Send + Sync>;

#[derive(Default)]
struct MockState {
  objects: BTreeMap<(String, PrimaryKey), ObjectHolder>,
  metadata: HashMap<String, ObjectTypeMetadata>,
  links: HashMap<(ObjectLocator, String), Vec<ObjectLocator>>,
  actions: HashMap<String, ActionHandler>,
  functions: HashMap<String, Value>,
  requests: Vec<Request>,
  fail_next_page: Option<RemoteError>,
  action_latency: Duration,
  metadata_latency: Duration,
  updates: Option<mpsc::UnboundedReceiver<ObjectSetUpdate>>,
}

pub struct MockDataSource {
  state: Mutex<MockState>,
}

fn link(target_type: &str, many: bool) -> LinkMetadata {
  LinkMetadata {
    target_type: target_type.to_string(),
    many,
  }
}

pub fn employee(pk: i64, name: &str) -> ObjectHolder {
  object("Employee", PrimaryKey::Integer(pk), json!({"employeeId": pk, "name": name}))
}

pub fn office(pk: &str, name: &str) -> ObjectHolder {
  object("Office", PrimaryKey::String(pk.to_string()), json!({"officeId": pk, "name": name}))
}

pub fn object(object_type: &str, primary_key: PrimaryKey, properties: Value) -> ObjectHolder {
  ObjectHolder::new(ObjectData {
    object_type: object_type.to_string(),
    primary_key,
    title: None,
    rid: None,
    properties: properties.as_object().cloned().unwrap_or_default(),
  })
}

impl MockDataSource {
  /// Knows `Employee` (key `employeeId`, link `office`) and `Office` (key
  /// `officeId`, link `occupants`).
  pub fn new() -> Self {
    let mut state = MockState::default();
    state.metadata.insert(
      "Employee".into(),
      ObjectTypeMetadata {
        api_name: "Employee".into(),
        primary_key: "employeeId".into(),
        links: BTreeMap::from([("office".to_string(), link("Office", false))]),
      },
    );
    state.metadata.insert(
      "Office".into(),
      ObjectTypeMetadata {
        api_name: "Office".into(),
        primary_key: "officeId".into(),
        links: BTreeMap::from([("occupants".to_string(), link("Employee", true))]),
      },
    );
    Self {
      state: Mutex::new(state),
    }
  }

  fn state(&self) -> MutexGuard<'_, MockState> {
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn insert(&self, object: impl Into<ObjectHolder>) {
    let object = object.into();
    self
      .state()
      .objects
      .insert((object.object_type.clone(), object.primary_key.clone()), object);
  }

  pub fn remove(&self, locator: &ObjectLocator) {
    self
      .state()
      .objects
      .remove(&(locator.object_type.clone(), locator.primary_key.clone()));
  }

  pub fn get(&self, locator: &ObjectLocator) -> Option<ObjectHolder> {
    self
      .state()
      .objects
      .get(&(locator.object_type.clone(), locator.primary_key.clone()))
      .cloned()
  }

  pub fn link<P: Into<PrimaryKey>, Q: Into<PrimaryKey>>(&self, from: (&str, P), link: &str, to: (&str, Q)) {
    self
      .state()
      .links
      .entry((ObjectLocator::new(from.0, from.1), link.to_string()))
      .or_default()
      .push(ObjectLocator::new(to.0, to.1));
  }

  pub fn requests(&self) -> Vec<Request> {
    self.state().requests.clone()
  }

  pub fn fail_next_page(&self, error: RemoteError) {
    self.state().fail_next_page = Some(error);
  }

  pub fn set_function(&self, api_name: &str, result: Value) {
    self.state().functions.insert(api_name.to_string(), result);
  }

  /// Script an action. The handler may edit the mock's objects.
  pub fn on_action(
    &self,
    action: &str,
    handler: impl Fn(&MockDataSource, &Value) -> Result<ActionEditResponse, RemoteError> + Send + Sync + 'static,
  ) {
    self.state().actions.insert(action.to_string(), Arc::new(handler));
  }

  /// Actions take this long (in tokio time) to answer.
  pub fn set_action_latency(&self, latency: Duration) {
    self.state().action_latency = latency;
  }

  /// Type metadata takes this long (in tokio time) to load.
  pub fn set_metadata_latency(&self, latency: Duration) {
    self.state().metadata_latency = latency;
  }

  /// Enable streaming; the next `subscribe_object_set` receives what is sent
  /// on the returned channel.
  pub fn stream_updates(&self) -> mpsc::UnboundedSender<ObjectSetUpdate> {
    let (tx, rx) = mpsc::unbounded();
    self.state().updates = Some(rx);
    tx
  }

  fn record(&self, request: Request) {
    self.state().requests.push(request);
  }

  fn evaluate(state: &MockState, object_set: &ObjectSetDefinition) -> Vec<ObjectHolder> {
    match object_set {
      ObjectSetDefinition::Base { object_type } => state
        .objects
        .values()
        .filter(|o| &o.object_type == object_type)
        .cloned()
        .collect(),
      ObjectSetDefinition::Filter {
        object_set,
        where_clause,
      } => Self::evaluate(state, object_set)
        .into_iter()
        .filter(|o| where_clause.matches_strictly(o))
        .collect(),
      ObjectSetDefinition::WithProperties { object_set, .. } => Self::evaluate(state, object_set),
      ObjectSetDefinition::SearchAround { object_set, link } => {
        let mut out: Vec<ObjectHolder> = Vec::new();
        for source in Self::evaluate(state, object_set) {
          let targets = state.links.get(&(source.locator(), link.clone()));
          for target in targets.into_iter().flatten() {
            let found = state
              .objects
              .get(&(target.object_type.clone(), target.primary_key.clone()));
            if let Some(found) = found {
              if !out.iter().any(|o| o.locator() == found.locator()) {
                out.push(found.clone());
              }
            }
          }
        }
        out
      }
      ObjectSetDefinition::Union { object_sets } => {
        let mut out: Vec<ObjectHolder> = Vec::new();
        for os in object_sets {
          for o in Self::evaluate(state, os) {
            if !out.iter().any(|x| x.locator() == o.locator()) {
              out.push(o);
            }
          }
        }
        out
      }
      ObjectSetDefinition::Intersect { object_sets } => {
        let mut sets = object_sets.iter().map(|os| Self::evaluate(state, os));
        let first = sets.next().unwrap_or_default();
        let rest: Vec<_> = sets.collect();
        first
          .into_iter()
          .filter(|o| rest.iter().all(|s| s.iter().any(|x| x.locator() == o.locator())))
          .collect()
      }
      ObjectSetDefinition::Subtract { object_sets } => {
        let mut sets = object_sets.iter().map(|os| Self::evaluate(state, os));
        let first = sets.next().unwrap_or_default();
        let rest: Vec<_> = sets.collect();
        first
          .into_iter()
          .filter(|o| !rest.iter().any(|s| s.iter().any(|x| x.locator() == o.locator())))
          .collect()
      }
    }
  }
}

#[async_trait]
impl RemoteDataSource for MockDataSource {
  async fn fetch_object_by_key(
    &self,
    object_type: &str,
    primary_key: &PrimaryKey,
  ) -> Result<Option<ObjectData>, RemoteError> {
    self.record(Request::FetchObject(object_type.to_string(), primary_key.clone()));
    Ok(
      self
        .state()
        .objects
        .get(&(object_type.to_string(), primary_key.clone()))
        .map(|o| (**o).clone()),
    )
  }

  async fn fetch_page(
    &self,
    object_set: &ObjectSetDefinition,
    request: &PageRequest,
  ) -> Result<PageResult, RemoteError> {
    self.record(Request::FetchPage {
      object_set: object_set.clone(),
      page_token: request.page_token.clone(),
    });
    let mut state = self.state();
    if let Some(e) = state.fail_next_page.take() {
      return Err(e);
    }
    let mut all = Self::evaluate(&state, object_set);
    if let Some(order_by) = &request.order_by {
      all.sort_by(|a, b| order_by.compare(a, b));
    }

    let total = all.len();
    let offset: usize = request
      .page_token
      .as_deref()
      .and_then(|t| t.parse().ok())
      .unwrap_or(0);
    let size = request.page_size.unwrap_or(total.max(1));
    let end = (offset + size).min(total);
    Ok(PageResult {
      data: all.get(offset..end).map(<[_]>::to_vec).unwrap_or_default(),
      next_page_token: (end < total).then(|| end.to_string()),
      total_count: Some(total as u64),
    })
  }

  async fn aggregate(&self, object_set: &ObjectSetDefinition, spec: &Value) -> Result<Value, RemoteError> {
    self.record(Request::Aggregate {
      object_set: object_set.clone(),
      spec: spec.clone(),
    });
    let count = Self::evaluate(&self.state(), object_set).len();
    Ok(json!({ "count": count }))
  }

  async fn apply_action(&self, action: &str, args: &Value) -> Result<ActionEditResponse, RemoteError> {
    self.record(Request::ApplyAction(action.to_string(), args.clone()));
    let (handler, latency) = {
      let state = self.state();
      (state.actions.get(action).cloned(), state.action_latency)
    };
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    match handler {
      Some(handler) => handler(self, args),
      None => Err(RemoteError::Http {
        status: 404,
        message: format!("no such action {}", action),
      }),
    }
  }

  async fn validate_action(&self, action: &str, args: &Value) -> Result<Value, RemoteError> {
    self.record(Request::ValidateAction(action.to_string(), args.clone()));
    Ok(json!({ "result": "VALID" }))
  }

  async fn fetch_type_metadata(&self, object_type: &str) -> Result<ObjectTypeMetadata, RemoteError> {
    self.record(Request::Metadata(object_type.to_string()));
    let latency = self.state().metadata_latency;
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
    self
      .state()
      .metadata
      .get(object_type)
      .cloned()
      .ok_or_else(|| RemoteError::Http {
        status: 404,
        message: format!("unknown object type {}", object_type),
      })
  }

  async fn execute_function(&self, api_name: &str, params: &Value) -> Result<Value, RemoteError> {
    self.record(Request::ExecuteFunction(api_name.to_string(), params.clone()));
    self
      .state()
      .functions
      .get(api_name)
      .cloned()
      .ok_or_else(|| RemoteError::Unsupported(format!("function {}", api_name)))
  }

  fn subscribe_object_set(
    &self,
    object_set: &ObjectSetDefinition,
  ) -> Result<BoxStream<'static, ObjectSetUpdate>, RemoteError> {
    self.record(Request::Subscribe(object_set.clone()));
    self
      .state()
      .updates
      .take()
      .map(StreamExt::boxed)
      .ok_or_else(|| RemoteError::Unsupported("object set subscriptions".to_string()))
  }
}
