//! # HTTP Document Store Client
//!
//! JSON-over-HTTP client for a remote document store project.
//!
//! ## Routes
//!
//! All routes live under `{base}/v1/projects/{project}`:
//!
//! - `GET    /collections/{c}/records/{id}`: fetch one record
//! - `GET    /collections/{c}/records?filter=<json>`: list records
//! - `PUT    /collections/{c}/records/{id}` with `If-None-Match: *`: create
//! - `PATCH  /collections/{c}/records/{id}`: merge a patch
//! - `DELETE /collections/{c}/records/{id}`: delete
//! - `GET    /collections/{c}/changes`: Server-Sent Events change feed
//! - `GET    /health`: handshake
//!
//! ## Status Mapping
//!
//! 404 is `NotFound`, 409 is `AlreadyExists`, 408/429/5xx and transport
//! errors are transient (`Unavailable`/`Timeout`), any other 4xx is
//! `Rejected`.

use super::{ChangeStream, DocumentStore, StoreConnector, StoreResult};
use crate::shared::{ChangeEvent, Filter, Payload, Record, StoreError};
use crate::tenant::ConnectionDescriptor;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Client for one remote store project
#[derive(Debug)]
pub struct HttpDocumentStore {
    client: Client,
    base_url: String,
    project: String,
    api_key: Option<String>,
    region: Option<String>,
    token: RwLock<Option<String>>,
}

impl HttpDocumentStore {
    /// Create a client with its own connection pool
    pub fn new(base_url: impl Into<String>, project: impl Into<String>, timeout: Duration) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(client, base_url, project))
    }

    /// Create a client sharing an existing connection pool
    pub fn with_client(client: Client, base_url: impl Into<String>, project: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project: project.into(),
            api_key: None,
            region: None,
            token: RwLock::new(None),
        }
    }

    /// Send `key` as `X-Api-Key` on every request
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Send `region` as `X-Region` on every request
    pub fn with_region(mut self, region: Option<String>) -> Self {
        self.region = region;
        self
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    /// Handshake: succeeds when the project answers its health route
    pub async fn health(&self) -> StoreResult<()> {
        let url = format!("{}/v1/projects/{}/health", self.base_url, self.project);
        let response = self.send(self.client.get(&url)).await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(status_error(response, "", "").await)
        }
    }

    fn collection_url(&self, collection: &str) -> String {
        format!(
            "{}/v1/projects/{}/collections/{}",
            self.base_url, self.project, collection
        )
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/records/{}", self.collection_url(collection), id)
    }

    async fn send(&self, request: RequestBuilder) -> StoreResult<Response> {
        let mut request = request;
        if let Some(key) = &self.api_key {
            request = request.header("X-Api-Key", key);
        }
        if let Some(region) = &self.region {
            request = request.header("X-Region", region);
        }
        let token = self
            .token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.map_err(transport_error)
    }

    async fn record_from(response: Response) -> StoreResult<Record> {
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Option<Record>> {
        let response = self.send(self.client.get(self.record_url(collection, id))).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(Self::record_from(response).await?)),
            _ => Err(status_error(response, collection, id).await),
        }
    }

    async fn list(&self, collection: &str, filter: Option<&Filter>) -> StoreResult<Vec<Record>> {
        let mut request = self
            .client
            .get(format!("{}/records", self.collection_url(collection)));
        if let Some(filter) = filter.filter(|f| !f.is_empty()) {
            request = request.query(&[("filter", serde_json::to_string(filter)?)]);
        }
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(response, collection, "").await);
        }
        let bytes = response.bytes().await.map_err(transport_error)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn create(&self, collection: &str, id: &str, payload: Payload) -> StoreResult<Record> {
        let request = self
            .client
            .put(self.record_url(collection, id))
            .header("If-None-Match", "*")
            .json(&payload);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(response, collection, id).await);
        }
        Self::record_from(response).await
    }

    async fn update(&self, collection: &str, id: &str, patch: Payload) -> StoreResult<Record> {
        let request = self.client.patch(self.record_url(collection, id)).json(&patch);
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(response, collection, id).await);
        }
        Self::record_from(response).await
    }

    async fn delete(&self, collection: &str, id: &str) -> StoreResult<()> {
        let response = self.send(self.client.delete(self.record_url(collection, id))).await?;
        if !response.status().is_success() {
            return Err(status_error(response, collection, id).await);
        }
        Ok(())
    }

    async fn watch(&self, collection: &str) -> StoreResult<ChangeStream> {
        let request = self
            .client
            .get(format!("{}/changes", self.collection_url(collection)))
            .header("Accept", "text/event-stream");
        let response = self.send(request).await?;
        if !response.status().is_success() {
            return Err(status_error(response, collection, "").await);
        }

        let state = SseState {
            body: response.bytes_stream().boxed(),
            buffer: String::new(),
            data: String::new(),
            ready: VecDeque::new(),
        };
        let feed = stream::unfold(state, |mut state| async move {
            loop {
                if let Some(event) = state.ready.pop_front() {
                    return Some((event, state));
                }
                match state.body.next().await {
                    Some(Ok(chunk)) => state.push(&String::from_utf8_lossy(&chunk)),
                    Some(Err(e)) => {
                        tracing::warn!("[HttpStore] change feed interrupted: {}", e);
                        return None;
                    }
                    None => return None,
                }
            }
        });
        Ok(feed.boxed())
    }

    fn authorize(&self, token: Option<&str>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = token.map(str::to_string);
    }
}

/// Incremental Server-Sent Events parser state
struct SseState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: String,
    data: String,
    ready: VecDeque<ChangeEvent>,
}

impl SseState {
    fn push(&mut self, text: &str) {
        self.buffer.push_str(text);
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                self.dispatch();
            } else if let Some(data) = line.strip_prefix("data:") {
                if !self.data.is_empty() {
                    self.data.push('\n');
                }
                self.data.push_str(data.trim_start());
            }
            // `event:`, `id:` and comment lines carry nothing we use.
        }
    }

    fn dispatch(&mut self) {
        if self.data.is_empty() {
            return;
        }
        let data = std::mem::take(&mut self.data);
        match serde_json::from_str::<ChangeEvent>(&data) {
            Ok(event) => self.ready.push_back(event),
            Err(e) => tracing::warn!("[HttpStore] dropping undecodable change event: {}", e),
        }
    }
}

fn transport_error(err: reqwest::Error) -> StoreError {
    if err.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::unavailable(format!("Network error: {}", err))
    }
}

/// Map a non-success response onto the store error taxonomy
async fn status_error(response: Response, collection: &str, id: &str) -> StoreError {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| status.to_string());
    classify_status(status, collection, id, &body)
}

fn classify_status(status: StatusCode, collection: &str, id: &str, body: &str) -> StoreError {
    match status {
        StatusCode::NOT_FOUND => StoreError::not_found(collection, id),
        StatusCode::CONFLICT => StoreError::already_exists(collection, id),
        StatusCode::REQUEST_TIMEOUT => StoreError::Timeout,
        StatusCode::TOO_MANY_REQUESTS => StoreError::unavailable(format!("{} - {}", status, body)),
        s if s.is_server_error() => StoreError::unavailable(format!("{} - {}", status, body)),
        _ => StoreError::rejected(format!("{} - {}", status, body)),
    }
}

/// Opens [`HttpDocumentStore`]s from tenant descriptors.
///
/// `url_template` maps an endpoint id to a base URL; `{endpoint}` and
/// `{region}` are substituted. An endpoint id that already is an
/// `http(s)://` URL is used as-is.
#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: Client,
    url_template: String,
}

impl HttpConnector {
    pub fn new(url_template: impl Into<String>, timeout: Duration) -> StoreResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url_template: url_template.into(),
        })
    }

    /// Base URL for a descriptor
    pub fn base_url(&self, descriptor: &ConnectionDescriptor) -> String {
        if descriptor.endpoint_id.starts_with("http://") || descriptor.endpoint_id.starts_with("https://") {
            return descriptor.endpoint_id.clone();
        }
        self.url_template
            .replace("{endpoint}", &descriptor.endpoint_id)
            .replace("{region}", descriptor.region.as_deref().unwrap_or(""))
    }
}

#[async_trait]
impl StoreConnector for HttpConnector {
    async fn connect(&self, descriptor: &ConnectionDescriptor) -> StoreResult<Arc<dyn DocumentStore>> {
        let base = self.base_url(descriptor);
        tracing::debug!("[HttpStore] Handshake with {} ({})", base, descriptor.project_id);
        let store = HttpDocumentStore::with_client(self.client.clone(), base, &descriptor.project_id)
            .with_api_key(&descriptor.api_key)
            .with_region(descriptor.region.clone());
        store.health().await?;
        Ok(Arc::new(store))
    }
}
