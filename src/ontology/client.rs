use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result as EyreResult};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::api_types::{
  aggregate_body, load_objects_body, ApiApplyActionResponse, ApiFullMetadata, ApiFunctionResponse,
  ApiLoadObjectsResponse, ApiObject,
};
use super::{
  ActionEditResponse, ObjectHolder, ObjectSetDefinition, ObjectTypeMetadata, PageRequest, PageResult,
  PrimaryKey, RemoteDataSource,
};
use crate::config::Config;
use crate::error::RemoteError;
use crate::ontology::ObjectData;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Ontologies v2 REST client.
#[derive(Clone)]
pub struct HttpDataSource {
  client: Client,
  base: Url,
  ontology: String,
}

impl HttpDataSource {
  pub fn new(base_url: &str, ontology: impl Into<String>, token: &str) -> Result<Self, RemoteError> {
    let base = Url::parse(base_url.trim_end_matches('/'))
      .map_err(|e| RemoteError::Transport(format!("invalid base url {}: {}", base_url, e)))?;
    if base.cannot_be_a_base() {
      return Err(RemoteError::Transport(format!("invalid base url {}", base_url)));
    }

    let mut headers = HeaderMap::new();
    let mut auth = HeaderValue::from_str(&format!("Bearer {}", token))
      .map_err(|e| RemoteError::Transport(format!("invalid token: {}", e)))?;
    auth.set_sensitive(true);
    headers.insert(AUTHORIZATION, auth);

    let client = Client::builder()
      .default_headers(headers)
      .timeout(REQUEST_TIMEOUT)
      .build()?;

    Ok(Self {
      client,
      base,
      ontology: ontology.into(),
    })
  }

  /// Client for the configured service, authenticated with the token from
  /// the environment.
  pub fn from_config(config: &Config) -> EyreResult<Self> {
    let token = Config::get_api_token()?;
    Self::new(&config.remote.url, config.remote.ontology.clone(), &token)
      .map_err(|e| eyre!("Failed to create ontology client: {}", e))
  }

  /// `{base}/api/v2/ontologies/{ontology}/{segments...}`, each segment
  /// percent-encoded.
  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path
        .pop_if_empty()
        .extend(["api", "v2", "ontologies", self.ontology.as_str()])
        .extend(segments);
    }
    url
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, RemoteError> {
    debug!(%url, "GET");
    let response = self.client.get(url).send().await?;
    parse_response(response).await
  }

  async fn post_json<T: DeserializeOwned, B: Serialize>(&self, url: Url, body: &B) -> Result<T, RemoteError> {
    debug!(%url, "POST");
    let response = self.client.post(url).json(body).send().await?;
    parse_response(response).await
  }
}

async fn parse_response<T: DeserializeOwned>(response: Response) -> Result<T, RemoteError> {
  let status = response.status();
  if !status.is_success() {
    let message = response.text().await.unwrap_or_default();
    return Err(RemoteError::Http {
      status: status.as_u16(),
      message,
    });
  }
  Ok(response.json::<T>().await?)
}

fn decode_page(response: ApiLoadObjectsResponse, object_type: Option<&str>) -> Result<PageResult, RemoteError> {
  let total_count = response.total_count();
  let data = response
    .data
    .into_iter()
    .map(|o| o.into_object_data(object_type).map(ObjectHolder::new))
    .collect::<Result<Vec<_>, _>>()?;
  Ok(PageResult {
    data,
    next_page_token: response.next_page_token,
    total_count,
  })
}

#[async_trait]
impl RemoteDataSource for HttpDataSource {
  async fn fetch_object_by_key(
    &self,
    object_type: &str,
    primary_key: &PrimaryKey,
  ) -> Result<Option<ObjectData>, RemoteError> {
    let pk = primary_key.to_string();
    let url = self.endpoint(&["objects", object_type, &pk]);
    match self.get_json::<ApiObject>(url).await {
      Ok(object) => object.into_object_data(Some(object_type)).map(Some),
      Err(RemoteError::Http { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => Ok(None),
      Err(e) => Err(e),
    }
  }

  async fn fetch_page(
    &self,
    object_set: &ObjectSetDefinition,
    request: &PageRequest,
  ) -> Result<PageResult, RemoteError> {
    let url = self.endpoint(&["objectSets", "loadObjects"]);
    let response: ApiLoadObjectsResponse = self.post_json(url, &load_objects_body(object_set, request)).await?;
    decode_page(response, object_set.static_result_type())
  }

  async fn aggregate(&self, object_set: &ObjectSetDefinition, spec: &Value) -> Result<Value, RemoteError> {
    let url = self.endpoint(&["objectSets", "aggregate"]);
    self.post_json(url, &aggregate_body(object_set, spec)).await
  }

  async fn apply_action(&self, action: &str, args: &Value) -> Result<ActionEditResponse, RemoteError> {
    let url = self.endpoint(&["actions", action, "apply"]);
    let body = json!({
      "parameters": args,
      "options": { "returnEdits": "ALL" },
    });
    let response: ApiApplyActionResponse = self.post_json(url, &body).await?;
    response.try_into()
  }

  async fn validate_action(&self, action: &str, args: &Value) -> Result<Value, RemoteError> {
    let url = self.endpoint(&["actions", action, "validate"]);
    self.post_json(url, &json!({ "parameters": args })).await
  }

  async fn fetch_type_metadata(&self, object_type: &str) -> Result<ObjectTypeMetadata, RemoteError> {
    let url = self.endpoint(&["objectTypes", object_type, "fullMetadata"]);
    let metadata: ApiFullMetadata = self.get_json(url).await?;
    Ok(metadata.into())
  }

  async fn execute_function(&self, api_name: &str, params: &Value) -> Result<Value, RemoteError> {
    let url = self.endpoint(&["queries", api_name, "execute"]);
    let response: ApiFunctionResponse = self.post_json(url, &json!({ "parameters": params })).await?;
    Ok(response.value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn source() -> HttpDataSource {
    HttpDataSource::new("https://stack.example.com/", "ri.ontology.main", "secret").expect("client")
  }

  #[test]
  fn test_endpoint_paths() {
    let s = source();
    assert_eq!(
      s.endpoint(&["objectSets", "loadObjects"]).as_str(),
      "https://stack.example.com/api/v2/ontologies/ri.ontology.main/objectSets/loadObjects"
    );
    assert_eq!(
      s.endpoint(&["objects", "Employee", "a b/c"]).as_str(),
      "https://stack.example.com/api/v2/ontologies/ri.ontology.main/objects/Employee/a%20b%2Fc"
    );
  }

  #[test]
  fn test_base_url_with_path_prefix() {
    let s = HttpDataSource::new("http://localhost:8080/proxy", "o", "t").expect("client");
    assert_eq!(
      s.endpoint(&["objectTypes", "Office", "fullMetadata"]).as_str(),
      "http://localhost:8080/proxy/api/v2/ontologies/o/objectTypes/Office/fullMetadata"
    );
  }

  #[test]
  fn test_rejects_bad_base_url() {
    assert!(matches!(
      HttpDataSource::new("not a url", "o", "t"),
      Err(RemoteError::Transport(_))
    ));
    assert!(matches!(
      HttpDataSource::new("mailto:someone@example.com", "o", "t"),
      Err(RemoteError::Transport(_))
    ));
  }

  #[test]
  fn test_decode_page_uses_type_hint() {
    let response: ApiLoadObjectsResponse = serde_json::from_value(json!({
      "data": [{"__primaryKey": 1, "name": "Ada"}],
      "nextPageToken": "p2",
      "totalCount": "12",
    }))
    .expect("json");
    let page = decode_page(response, Some("Employee")).expect("page");
    assert_eq!(page.data[0].object_type, "Employee");
    assert_eq!(page.next_page_token.as_deref(), Some("p2"));
    assert_eq!(page.total_count, Some(12));
  }
}
