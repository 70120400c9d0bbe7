//! HTTP store client.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use docshift_core::store::{
    BulkOperation, BulkResponse, Hit, IndexStats, SearchPage, StoreClient,
};
use docshift_core::StoreError;

use crate::config::ClientConfig;
use crate::error::{missing_index, Error};

const NDJSON: &str = "application/x-ndjson";

/// A [`StoreClient`] speaking the Elasticsearch REST API.
#[derive(Debug, Clone)]
pub struct HttpStore {
    client: Client,
    base: Url,
    config: ClientConfig,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Total {
    Count(u64),
    Object { value: u64 },
}

impl Default for Total {
    fn default() -> Self {
        Total::Count(0)
    }
}

impl Total {
    fn value(&self) -> u64 {
        match self {
            Total::Count(n) | Total::Object { value: n } => *n,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct Hits {
    #[serde(default)]
    total: Total,
    #[serde(default)]
    hits: Vec<Hit>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(rename = "_scroll_id", default)]
    scroll_id: Option<String>,
    #[serde(default)]
    hits: Hits,
}

impl From<SearchResponse> for SearchPage {
    fn from(response: SearchResponse) -> Self {
        SearchPage {
            cursor_id: response.scroll_id,
            total: response.hits.total.value(),
            hits: response.hits.hits,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GetResponse {
    #[serde(default)]
    found: bool,
    #[serde(flatten)]
    hit: Hit,
}

/// Encode bulk `index` actions as a newline-delimited JSON body.
pub(crate) fn bulk_body(operations: &[BulkOperation]) -> Result<String, Error> {
    let mut body = String::new();
    for op in operations {
        let action = json!({
            "index": { "_index": op.index, "_type": op.doc_type, "_id": op.id }
        });
        body.push_str(&serde_json::to_string(&action)?);
        body.push('\n');
        body.push_str(&serde_json::to_string(&op.source)?);
        body.push('\n');
    }
    Ok(body)
}

impl HttpStore {
    /// Create a client for the store described by `config`.
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let base = Url::parse(&config.url).map_err(|e| Error::InvalidConfig(format!("{}: {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(Error::InvalidConfig(format!("{} cannot be a base URL", config.url)));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        info!(url = %config.url, "created store client");
        Ok(Self { client, base, config })
    }

    /// Client configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if segments.is_empty() {
            return url;
        }
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let builder = self.client.request(method, self.endpoint(segments));
        match &self.config.username {
            Some(user) => builder.basic_auth(user, self.config.password.as_deref()),
            None => builder,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, Error> {
        let response = request.send().await?;
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Err(Error::Status { status, body })
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, Error> {
        let bytes = response.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Send a request that may legitimately answer 404.
    async fn send_allowing_missing(&self, request: RequestBuilder) -> Result<Option<Response>, Error> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(Some(response));
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND && missing_index(&body).is_none() {
            return Ok(None);
        }
        Err(Error::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl StoreClient for HttpStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.send(self.request(Method::HEAD, &[])).await?;
        Ok(())
    }

    async fn list_indices(&self) -> Result<Vec<IndexStats>, StoreError> {
        let request = self
            .request(Method::GET, &["_cat", "indices"])
            .query(&[("format", "json")]);
        let response = self.send(request).await?;
        Ok(Self::decode(response).await?)
    }

    async fn open_cursor(
        &self,
        index: &str,
        keep_alive: &str,
        page_size: usize,
    ) -> Result<SearchPage, StoreError> {
        let request = self
            .request(Method::POST, &[index, "_search"])
            .query(&[("scroll", keep_alive.to_string()), ("size", page_size.to_string())])
            .json(&json!({ "query": { "match_all": {} }, "sort": ["_doc"] }));
        let response = self.send(request).await?;
        let page: SearchResponse = Self::decode(response).await?;
        debug!(index, total = page.hits.total.value(), "opened cursor");
        Ok(page.into())
    }

    async fn continue_cursor(
        &self,
        cursor_id: &str,
        keep_alive: &str,
    ) -> Result<SearchPage, StoreError> {
        let request = self
            .request(Method::POST, &["_search", "scroll"])
            .json(&json!({ "scroll": keep_alive, "scroll_id": cursor_id }));
        match self.send(request).await {
            Ok(response) => {
                let page: SearchResponse = Self::decode(response).await?;
                Ok(page.into())
            }
            Err(Error::Status { status: 404, .. }) => Err(StoreError::UnknownCursor(cursor_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn clear_cursor(&self, cursor_id: &str) -> Result<(), StoreError> {
        let request = self
            .request(Method::DELETE, &["_search", "scroll"])
            .json(&json!({ "scroll_id": [cursor_id] }));
        self.send_allowing_missing(request).await?;
        Ok(())
    }

    async fn search_by_type(
        &self,
        index: &str,
        doc_type: &str,
        size: usize,
    ) -> Result<Vec<Hit>, StoreError> {
        let request = self
            .request(Method::POST, &[index, doc_type, "_search"])
            .query(&[("size", size.to_string())])
            .json(&json!({ "query": { "match_all": {} } }));
        let response = self.send(request).await?;
        let page: SearchResponse = Self::decode(response).await?;
        Ok(page.hits.hits)
    }

    async fn bulk(&self, operations: Vec<BulkOperation>) -> Result<BulkResponse, StoreError> {
        if operations.is_empty() {
            return Ok(BulkResponse::default());
        }
        let body = bulk_body(&operations)?;
        let request = self
            .request(Method::POST, &["_bulk"])
            .header(reqwest::header::CONTENT_TYPE, NDJSON)
            .body(body);
        let response = self.send(request).await?;
        let bulk: BulkResponse = Self::decode(response).await?;
        debug!(items = bulk.items.len(), errors = bulk.errors, "bulk request done");
        Ok(bulk)
    }

    async fn get_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
    ) -> Result<Option<Hit>, StoreError> {
        let request = self.request(Method::GET, &[index, doc_type, id]);
        let Some(response) = self.send_allowing_missing(request).await? else {
            return Ok(None);
        };
        let found: GetResponse = Self::decode(response).await?;
        Ok(found.found.then_some(found.hit))
    }

    async fn put_document(
        &self,
        index: &str,
        doc_type: &str,
        id: &str,
        body: Value,
    ) -> Result<(), StoreError> {
        let request = self.request(Method::PUT, &[index, doc_type, id]).json(&body);
        self.send(request).await?;
        Ok(())
    }

    async fn index_exists(&self, index: &str) -> Result<bool, StoreError> {
        let response = self.request(Method::HEAD, &[index]).send().await.map_err(Error::from)?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(StoreError::Status {
                status: status.as_u16(),
                body: String::new(),
            }),
        }
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<(), StoreError> {
        if indices.is_empty() {
            return Ok(());
        }
        let joined = indices.join(",");
        self.send(self.request(Method::DELETE, &[&joined])).await?;
        debug!(indices = %joined, "deleted indices");
        Ok(())
    }
}
