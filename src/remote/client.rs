use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{RequestBuilder, Response};
use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::config::{Config, RemoteConfig};
use crate::query::TableQuery;
use crate::queue::{MutationKind, WritePayload};
use crate::row::{Row, ID_FIELD};

use super::{RemoteApi, RemoteError};

/// Client for a PostgREST-style REST endpoint with object storage, as exposed
/// by hosted Postgres backends.
#[derive(Clone)]
pub struct HttpRemote {
  http: reqwest::Client,
  base: Url,
  api_key: String,
  access_token: Option<String>,
  bucket: String,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig) -> Result<Self> {
    let api_key = Config::get_api_key()?;
    let access_token = Config::get_access_token();
    Self::with_credentials(config, api_key, access_token)
  }

  pub fn with_credentials(
    config: &RemoteConfig,
    api_key: String,
    access_token: Option<String>,
  ) -> Result<Self> {
    let mut base = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote url '{}': {}", config.url, e))?;
    if !base.path().ends_with('/') {
      let path = format!("{}/", base.path());
      base.set_path(&path);
    }

    let http = reqwest::Client::builder()
      .timeout(config.request_timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      http,
      base,
      api_key,
      access_token,
      bucket: config.storage_bucket.clone(),
    })
  }

  fn endpoint(&self, path: &str) -> Result<Url, RemoteError> {
    self.base.join(path).map_err(|e| RemoteError::Rejected {
      status: 0,
      message: format!("invalid endpoint {}: {}", path, e),
    })
  }

  fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
    self.endpoint(&format!("rest/v1/{}", table))
  }

  fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
    let bearer = self.access_token.as_deref().unwrap_or(&self.api_key);
    request.header("apikey", &self.api_key).bearer_auth(bearer)
  }

  async fn send(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
    let response = self
      .authorize(request)
      .send()
      .await
      .map_err(|e| RemoteError::Unavailable(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response
      .text()
      .await
      .unwrap_or_else(|_| "Unknown error".to_string());
    Err(RemoteError::from_status(status.as_u16(), body))
  }

  async fn rows(response: Response) -> Result<Vec<Row>, RemoteError> {
    let status = response.status().as_u16();
    response
      .json::<Vec<Row>>()
      .await
      .map_err(|e| RemoteError::Rejected {
        status,
        message: format!("unexpected response body: {}", e),
      })
  }

  /// Upload attached files and point their fields at the stored objects.
  async fn upload_files(&self, table: &str, payload: WritePayload) -> Result<Row, RemoteError> {
    let WritePayload { mut data, files } = payload;
    for (field, blob) in files {
      let object = format!(
        "{}/{}-{}",
        table,
        uuid::Uuid::new_v4().simple(),
        blob.file_name
      );
      let url = self.endpoint(&format!("storage/v1/object/{}/{}", self.bucket, object))?;
      debug!(table, %field, %object, bytes = blob.bytes.len(), "uploading file");
      self
        .send(
          self
            .http
            .post(url)
            .header("content-type", blob.content_type)
            .body(blob.bytes),
        )
        .await?;
      data.insert(field, Value::String(object));
    }
    Ok(data)
  }
}

fn id_filter(data: &mut Row, table: &str, kind: MutationKind) -> Result<String, RemoteError> {
  let id = data.remove(ID_FIELD).ok_or_else(|| RemoteError::Rejected {
    status: 0,
    message: format!("{} on {} requires an id", kind, table),
  })?;
  let rendered = match id {
    Value::String(s) => s,
    other => other.to_string(),
  };
  Ok(format!("eq.{}", rendered))
}

#[async_trait]
impl RemoteApi for HttpRemote {
  async fn fetch(&self, table: &str, query: &TableQuery) -> Result<Vec<Row>, RemoteError> {
    let mut url = self.table_url(table)?;
    url.query_pairs_mut().extend_pairs(query.to_params());

    let response = self.send(self.http.get(url)).await?;
    let rows = Self::rows(response).await?;
    debug!(table, rows = rows.len(), "fetched rows");
    Ok(rows)
  }

  async fn mutate(
    &self,
    table: &str,
    kind: MutationKind,
    payload: WritePayload,
  ) -> Result<Option<Row>, RemoteError> {
    let mut data = self.upload_files(table, payload).await?;
    let mut url = self.table_url(table)?;

    let request = match kind {
      MutationKind::Insert => self.http.post(url).json(&[&data]),
      MutationKind::Update => {
        let filter = id_filter(&mut data, table, kind)?;
        url.query_pairs_mut().append_pair(ID_FIELD, &filter);
        self.http.patch(url).json(&data)
      }
      MutationKind::Delete => {
        let filter = id_filter(&mut data, table, kind)?;
        url.query_pairs_mut().append_pair(ID_FIELD, &filter);
        self.http.delete(url)
      }
    };

    let response = self
      .send(request.header("Prefer", "return=representation"))
      .await?;
    let mut rows = Self::rows(response).await?;

    match (kind, rows.is_empty()) {
      (MutationKind::Update, true) => Err(RemoteError::Rejected {
        status: 404,
        message: format!("no {} row matched the update", table),
      }),
      (_, true) => Ok(None),
      (_, false) => Ok(Some(rows.swap_remove(0))),
    }
  }

  fn is_authenticated(&self) -> bool {
    self.access_token.is_some()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::row::row_from_value;
  use serde_json::json;

  fn remote(url: &str) -> HttpRemote {
    let config = RemoteConfig {
      url: url.to_string(),
      storage_bucket: "uploads".to_string(),
      request_timeout_secs: 1,
    };
    HttpRemote::with_credentials(&config, "anon".to_string(), None).unwrap()
  }

  #[test]
  fn test_table_url_keeps_base_path() {
    let remote = remote("https://example.supabase.co/api");
    assert_eq!(
      remote.table_url("students").unwrap().as_str(),
      "https://example.supabase.co/api/rest/v1/students"
    );
    assert!(!remote.is_authenticated());
  }

  #[test]
  fn test_id_filter_strips_id() {
    let mut data = row_from_value(json!({"id": 12, "name": "Jo"}));
    assert_eq!(
      id_filter(&mut data, "workers", MutationKind::Update).unwrap(),
      "eq.12"
    );
    assert!(!data.contains_key("id"));
    assert!(id_filter(&mut data, "workers", MutationKind::Delete).is_err());
  }

  #[tokio::test]
  async fn test_unreachable_host_is_unavailable() {
    let remote = remote("http://127.0.0.1:9");
    let err = remote
      .fetch("students", &TableQuery::all())
      .await
      .unwrap_err();
    assert!(err.is_connectivity());
  }
}
