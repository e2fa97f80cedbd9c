//! Kubernetes API client over HTTP
//!
//! Lists are paged with `limit`/`continue`; watches are newline-delimited
//! JSON event streams. Only the calls a synchro needs are implemented.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::Value;

use super::{ClusterClient, ClusterConnector, ClusterEventStream, ListResult, WatchEvent};
use crate::error::{Result, SynchroError};
use crate::types::{ClusterConnection, ClusterDefinition, GroupVersionResource, ResourceType};

/// Items requested per list page
const LIST_PAGE_SIZE: usize = 500;

/// Server-side watch timeout; the synchro resumes when it expires
const WATCH_TIMEOUT_SECS: u64 = 290;

/// HTTP client for one member cluster
pub struct HttpClusterClient {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
    request_timeout: Duration,
}

impl HttpClusterClient {
    pub fn new(
        connection: &ClusterConnection,
        token: Option<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .danger_accept_invalid_certs(connection.insecure_skip_tls_verify)
            .build()
            .map_err(|e| SynchroError::ConnectionFailure(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: connection.endpoint.trim_end_matches('/').to_string(),
            token,
            request_timeout,
        })
    }

    fn collection_url(&self, gvr: &GroupVersionResource) -> String {
        format!("{}{}", self.endpoint, resource_path(gvr))
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// API path of a resource collection across all namespaces
pub fn resource_path(gvr: &GroupVersionResource) -> String {
    if gvr.group.is_empty() {
        format!("/api/{}/{}", gvr.version, gvr.resource)
    } else {
        format!("/apis/{}/{}/{}", gvr.group, gvr.version, gvr.resource)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status == reqwest::StatusCode::GONE {
        return Err(SynchroError::ResourceVersionTooOld(body));
    }
    Err(SynchroError::ConnectionFailure(format!(
        "status {}: {}",
        status, body
    )))
}

/// Fill in the type fields list items are served without
fn with_type(mut object: Value, resource: &ResourceType) -> Value {
    if let Value::Object(fields) = &mut object {
        fields
            .entry("apiVersion")
            .or_insert_with(|| Value::String(resource.gvr.api_version()));
        fields
            .entry("kind")
            .or_insert_with(|| Value::String(resource.kind.clone()));
    }
    object
}

#[derive(Deserialize)]
struct ListMeta {
    #[serde(default, rename = "resourceVersion")]
    resource_version: String,
    #[serde(default, rename = "continue")]
    continue_token: Option<String>,
}

#[derive(Deserialize)]
struct ListResponse {
    metadata: ListMeta,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Deserialize)]
struct RawWatchEvent {
    #[serde(rename = "type")]
    event_type: String,
    object: Value,
}

/// Parse one line of a watch response
///
/// Bookmarks without a resource version carry no progress and yield `None`.
pub fn parse_watch_line(line: &[u8], resource: &ResourceType) -> Result<Option<WatchEvent>> {
    let raw: RawWatchEvent = serde_json::from_slice(line)
        .map_err(|e| SynchroError::ConnectionFailure(format!("malformed watch event: {}", e)))?;

    match raw.event_type.as_str() {
        "ADDED" => Ok(Some(WatchEvent::Added(with_type(raw.object, resource)))),
        "MODIFIED" => Ok(Some(WatchEvent::Modified(with_type(raw.object, resource)))),
        "DELETED" => Ok(Some(WatchEvent::Deleted(with_type(raw.object, resource)))),
        "BOOKMARK" => Ok(raw
            .object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .filter(|rv| !rv.is_empty())
            .map(|rv| WatchEvent::Bookmark(rv.to_string()))),
        "ERROR" => {
            let message = raw
                .object
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("watch error")
                .to_string();
            match raw.object.get("code").and_then(Value::as_u64) {
                Some(410) => Err(SynchroError::ResourceVersionTooOld(message)),
                _ => Err(SynchroError::ConnectionFailure(message)),
            }
        }
        other => Err(SynchroError::ConnectionFailure(format!(
            "unknown watch event type '{}'",
            other
        ))),
    }
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(line.len());
    let end = line
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |i| i + 1);
    &line[start..end]
}

struct LineReader {
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    resource: ResourceType,
    done: bool,
}

fn event_stream(
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    resource: ResourceType,
) -> ClusterEventStream {
    let reader = LineReader {
        body,
        buffer: Vec::new(),
        resource,
        done: false,
    };

    Box::pin(stream::unfold(reader, |mut reader| async move {
        loop {
            if reader.done {
                return None;
            }
            if let Some(pos) = reader.buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = reader.buffer.drain(..=pos).collect();
                let line = trim_line(&line);
                if line.is_empty() {
                    continue;
                }
                match parse_watch_line(line, &reader.resource).transpose() {
                    Some(event) => {
                        reader.done = event.is_err();
                        return Some((event, reader));
                    }
                    None => continue,
                }
            }
            match reader.body.next().await {
                Some(Ok(chunk)) => reader.buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    reader.done = true;
                    return Some((Err(SynchroError::ConnectionFailure(e.to_string())), reader));
                }
                None => {
                    reader.done = true;
                    let rest = std::mem::take(&mut reader.buffer);
                    let rest = trim_line(&rest);
                    if rest.is_empty() {
                        return None;
                    }
                    return parse_watch_line(rest, &reader.resource)
                        .transpose()
                        .map(|event| (event, reader));
                }
            }
        }
    }))
}

#[async_trait]
impl ClusterClient for HttpClusterClient {
    async fn list(&self, resource: &ResourceType) -> Result<ListResult> {
        let url = self.collection_url(&resource.gvr);
        let mut result = ListResult::default();
        let mut continue_token: Option<String> = None;

        loop {
            let mut query = vec![("limit", LIST_PAGE_SIZE.to_string())];
            if let Some(token) = &continue_token {
                query.push(("continue", token.clone()));
            }

            let response = self
                .get(&url)
                .query(&query)
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(|e| SynchroError::ConnectionFailure(e.to_string()))?;
            let page: ListResponse = check_status(response)
                .await?
                .json()
                .await
                .map_err(|e| SynchroError::ConnectionFailure(format!("malformed list: {}", e)))?;

            result
                .items
                .extend(page.items.into_iter().map(|item| with_type(item, resource)));
            // The first page's version describes the whole snapshot
            if result.resource_version.is_empty() {
                result.resource_version = page.metadata.resource_version;
            }

            match page.metadata.continue_token.filter(|t| !t.is_empty()) {
                Some(token) => continue_token = Some(token),
                None => break,
            }
        }

        tracing::debug!(
            resource = %resource.gvr,
            items = result.items.len(),
            resource_version = %result.resource_version,
            "listed resources"
        );
        Ok(result)
    }

    async fn watch(
        &self,
        resource: &ResourceType,
        resource_version: &str,
    ) -> Result<ClusterEventStream> {
        let url = self.collection_url(&resource.gvr);
        let timeout_secs = WATCH_TIMEOUT_SECS.to_string();
        let response = self
            .get(&url)
            .query(&[
                ("watch", "1"),
                ("allowWatchBookmarks", "true"),
                ("resourceVersion", resource_version),
                ("timeoutSeconds", timeout_secs.as_str()),
            ])
            .send()
            .await
            .map_err(|e| SynchroError::ConnectionFailure(e.to_string()))?;
        let response = check_status(response).await?;

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(event_stream(body, resource.clone()))
    }
}

/// Connects to clusters over HTTP with bearer tokens read from files
pub struct HttpConnector {
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl ClusterConnector for HttpConnector {
    async fn connect(&self, definition: &ClusterDefinition) -> Result<Arc<dyn ClusterClient>> {
        let connection = &definition.connection;
        let token = match &connection.token_file {
            Some(path) => {
                let path = shellexpand::tilde(path).to_string();
                let token = tokio::fs::read_to_string(&path).await?;
                Some(token.trim().to_string())
            }
            None => None,
        };
        let timeout = connection
            .request_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.request_timeout);

        Ok(Arc::new(HttpClusterClient::new(connection, token, timeout)?))
    }
}
