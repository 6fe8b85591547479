//! etcd v2 HTTP API client implementing [`KvStore`].

use super::{KvAction, KvEvent, KvStore, Listing, SourceEntry, SourceResult};
use crate::error::SourceError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::time::Duration;

const ETCD_INDEX_HEADER: &str = "X-Etcd-Index";
const ECODE_KEY_NOT_FOUND: u32 = 100;
const ECODE_TEST_FAILED: u32 = 101;
const ECODE_EVENT_INDEX_CLEARED: u32 = 401;

/// Authentication method for etcd requests.
#[derive(Clone)]
pub enum EtcdAuth {
    /// No authentication
    None,
    /// Basic authentication (username, password)
    Basic(String, String),
}

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNode>,
    #[serde(rename = "prevNode")]
    prev_node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: String,
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(rename = "modifiedIndex", default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
struct EtcdErrorBody {
    #[serde(rename = "errorCode")]
    error_code: u32,
    message: String,
    #[serde(default)]
    cause: String,
}

/// etcd v2 store over HTTP.
///
/// Uses the `/v2/keys` API: recursive GET for listings, `wait=true` long
/// polls anchored with `waitIndex`, and `prevIndex` guarded PUT/DELETE for
/// rollbacks.
///
/// # Examples
///
/// ```rust,no_run
/// use hotswap_flags::sources::EtcdV2Store;
/// use std::time::Duration;
///
/// # fn example() -> Result<(), hotswap_flags::error::SourceError> {
/// let store = EtcdV2Store::builder()
///     .with_endpoint("http://127.0.0.1:2379")
///     .with_request_timeout(Duration::from_secs(5))
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct EtcdV2Store {
    endpoint: String,
    client: Client,
    auth: EtcdAuth,
    request_timeout: Duration,
}

impl EtcdV2Store {
    /// Create a new builder for constructing an etcd store.
    pub fn builder() -> EtcdV2StoreBuilder {
        EtcdV2StoreBuilder::new()
    }

    fn key_url(&self, key: &str) -> String {
        let key = key.trim_start_matches('/');
        format!("{}/v2/keys/{}", self.endpoint, key)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            EtcdAuth::None => request,
            EtcdAuth::Basic(username, password) => request.basic_auth(username, Some(password)),
        }
    }

    async fn send(&self, request: RequestBuilder) -> SourceResult<Response> {
        self.authorize(request).send().await.map_err(classify_transport)
    }

    async fn decode(response: Response) -> SourceResult<(EtcdResponse, u64)> {
        let status = response.status();
        let index = header_index(&response);
        let body = response.text().await.map_err(classify_transport)?;

        if status.is_server_error() {
            return Err(SourceError::Unavailable(format!(
                "etcd returned {}: {}",
                status,
                status.canonical_reason().unwrap_or("Unknown")
            )));
        }

        if !status.is_success() {
            return Err(decode_error(status, &body));
        }

        // A long poll closed by etcd without an event has an empty body.
        if body.trim().is_empty() {
            return Err(SourceError::Timeout);
        }

        let parsed: EtcdResponse = serde_json::from_str(&body)
            .map_err(|e| SourceError::Malformed(format!("Failed to parse etcd response: {}", e)))?;
        Ok((parsed, index))
    }
}

fn header_index(response: &Response) -> u64 {
    response
        .headers()
        .get(ETCD_INDEX_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn classify_transport(err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else {
        SourceError::Unavailable(format!("etcd request failed: {}", err))
    }
}

fn decode_error(status: StatusCode, body: &str) -> SourceError {
    match serde_json::from_str::<EtcdErrorBody>(body) {
        Ok(err) => match err.error_code {
            ECODE_KEY_NOT_FOUND => SourceError::KeyNotFound(err.cause),
            ECODE_TEST_FAILED => SourceError::CompareFailed(err.cause),
            ECODE_EVENT_INDEX_CLEARED => SourceError::IndexCleared(0),
            code => SourceError::Malformed(format!("etcd error {}: {}", code, err.message)),
        },
        Err(_) => SourceError::Malformed(format!("etcd returned {} with body '{}'", status, body)),
    }
}

fn flatten(node: EtcdNode, out: &mut Vec<SourceEntry>) {
    if node.dir {
        for child in node.nodes {
            flatten(child, out);
        }
    } else if let Some(value) = node.value {
        out.push(SourceEntry {
            key: node.key,
            value,
            index: node.modified_index,
        });
    }
}

fn to_event(response: EtcdResponse) -> SourceResult<KvEvent> {
    let node = response
        .node
        .ok_or_else(|| SourceError::Malformed("watch response without node".to_string()))?;
    let action = match response.action.as_str() {
        "delete" | "expire" | "compareAndDelete" => KvAction::Delete,
        _ => KvAction::Put,
    };
    Ok(KvEvent {
        action,
        key: node.key,
        value: node.value,
        index: node.modified_index,
        previous: response.prev_node.and_then(|n| n.value),
    })
}

#[async_trait]
impl KvStore for EtcdV2Store {
    fn name(&self) -> String {
        format!("etcd:{}", self.endpoint)
    }

    async fn list(&self, prefix: &str) -> SourceResult<Listing> {
        let request = self
            .client
            .get(self.key_url(prefix))
            .query(&[("recursive", "true"), ("sorted", "true")])
            .timeout(self.request_timeout);
        let response = self.send(request).await?;
        let status = response.status();
        let index = header_index(&response);

        match Self::decode(response).await {
            Ok((parsed, index)) => {
                let mut entries = Vec::new();
                if let Some(node) = parsed.node {
                    flatten(node, &mut entries);
                }
                entries.sort_by(|a, b| a.key.cmp(&b.key));
                Ok(Listing {
                    entries,
                    cursor: index,
                })
            }
            // An absent prefix is an empty namespace, not a failure.
            Err(SourceError::KeyNotFound(_)) if status == StatusCode::NOT_FOUND => Ok(Listing {
                entries: Vec::new(),
                cursor: index,
            }),
            Err(e) => Err(e),
        }
    }

    async fn watch(&self, prefix: &str, after: u64, timeout: Duration) -> SourceResult<KvEvent> {
        let wait_index = (after + 1).to_string();
        let request = self
            .client
            .get(self.key_url(prefix))
            .query(&[
                ("wait", "true"),
                ("recursive", "true"),
                ("waitIndex", wait_index.as_str()),
            ])
            .timeout(timeout);
        let response = self.send(request).await?;
        match Self::decode(response).await {
            Ok((parsed, _)) => to_event(parsed),
            Err(SourceError::IndexCleared(_)) => Err(SourceError::IndexCleared(after)),
            Err(e) => Err(e),
        }
    }

    async fn compare_and_swap(&self, key: &str, value: &str, prev_index: u64) -> SourceResult<u64> {
        let request = self
            .client
            .put(self.key_url(key))
            .query(&[("prevIndex", prev_index.to_string())])
            .form(&[("value", value)])
            .timeout(self.request_timeout);
        let response = self.send(request).await?;
        let (parsed, index) = Self::decode(response).await?;
        Ok(parsed.node.map(|n| n.modified_index).unwrap_or(index))
    }

    async fn compare_and_delete(&self, key: &str, prev_index: u64) -> SourceResult<u64> {
        let request = self
            .client
            .delete(self.key_url(key))
            .query(&[("prevIndex", prev_index.to_string())])
            .timeout(self.request_timeout);
        let response = self.send(request).await?;
        let (parsed, index) = Self::decode(response).await?;
        Ok(parsed.node.map(|n| n.modified_index).unwrap_or(index))
    }
}

/// Builder for constructing an `EtcdV2Store`.
pub struct EtcdV2StoreBuilder {
    endpoint: Option<String>,
    auth: EtcdAuth,
    request_timeout: Duration,
}

impl EtcdV2StoreBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            endpoint: None,
            auth: EtcdAuth::None,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Set the etcd client URL, e.g. `http://127.0.0.1:2379`.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set Basic authentication.
    pub fn with_basic_auth(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.auth = EtcdAuth::Basic(username.into(), password.into());
        self
    }

    /// Timeout for listings and conditional writes.
    ///
    /// Long polls use the watcher's poll timeout instead. Default is 10 seconds.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Build the store.
    ///
    /// # Errors
    ///
    /// Returns an error if no endpoint is provided or the HTTP client cannot
    /// be constructed.
    pub fn build(self) -> SourceResult<EtcdV2Store> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| SourceError::Unavailable("endpoint is required for EtcdV2Store".to_string()))?;

        let client = Client::builder()
            .build()
            .map_err(|e| SourceError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

        Ok(EtcdV2Store {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            auth: self.auth,
            request_timeout: self.request_timeout,
        })
    }
}

impl Default for EtcdV2StoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let store = EtcdV2Store::builder()
            .with_endpoint("http://127.0.0.1:2379/")
            .with_basic_auth("user", "pass")
            .with_request_timeout(Duration::from_secs(5))
            .build()
            .unwrap();

        assert_eq!(store.endpoint, "http://127.0.0.1:2379");
        assert_eq!(
            store.key_url("/flags/svc"),
            "http://127.0.0.1:2379/v2/keys/flags/svc"
        );
        assert_eq!(store.name(), "etcd:http://127.0.0.1:2379");
    }

    #[test]
    fn test_builder_no_endpoint() {
        assert!(EtcdV2Store::builder().build().is_err());
    }

    #[test]
    fn test_flatten_recursive_listing() {
        let body = r#"{
            "action": "get",
            "node": {
                "key": "/flags/svc", "dir": true, "modifiedIndex": 2,
                "nodes": [
                    {"key": "/flags/svc/b", "value": "2", "modifiedIndex": 7},
                    {"key": "/flags/svc/sub", "dir": true, "modifiedIndex": 3, "nodes": [
                        {"key": "/flags/svc/sub/c", "value": "3", "modifiedIndex": 4}
                    ]},
                    {"key": "/flags/svc/a", "value": "1", "modifiedIndex": 5}
                ]
            }
        }"#;
        let parsed: EtcdResponse = serde_json::from_str(body).unwrap();
        let mut entries = Vec::new();
        flatten(parsed.node.unwrap(), &mut entries);

        let keys: Vec<_> = entries.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(keys, vec!["/flags/svc/b", "/flags/svc/sub/c", "/flags/svc/a"]);
        assert_eq!(entries[0].index, 7);
    }

    #[test]
    fn test_watch_event_with_prev_node() {
        let body = r#"{
            "action": "set",
            "node": {"key": "/flags/svc/count", "value": "notanumber", "modifiedIndex": 12},
            "prevNode": {"key": "/flags/svc/count", "value": "20", "modifiedIndex": 9}
        }"#;
        let event = to_event(serde_json::from_str(body).unwrap()).unwrap();
        assert_eq!(event.action, KvAction::Put);
        assert_eq!(event.index, 12);
        assert_eq!(event.value.as_deref(), Some("notanumber"));
        assert_eq!(event.previous.as_deref(), Some("20"));
    }

    #[test]
    fn test_delete_event() {
        let body = r#"{
            "action": "delete",
            "node": {"key": "/flags/svc/count", "modifiedIndex": 13},
            "prevNode": {"key": "/flags/svc/count", "value": "20", "modifiedIndex": 9}
        }"#;
        let event = to_event(serde_json::from_str(body).unwrap()).unwrap();
        assert_eq!(event.action, KvAction::Delete);
        assert_eq!(event.value, None);
    }

    #[test]
    fn test_error_codes() {
        let cleared = r#"{"errorCode":401,"message":"The event in requested index is outdated and cleared","cause":"the requested history has been cleared [8/3]","index":1008}"#;
        assert_eq!(
            decode_error(StatusCode::BAD_REQUEST, cleared),
            SourceError::IndexCleared(0)
        );

        let compare = r#"{"errorCode":101,"message":"Compare failed","cause":"[3 != 4]","index":8}"#;
        assert!(matches!(
            decode_error(StatusCode::PRECONDITION_FAILED, compare),
            SourceError::CompareFailed(_)
        ));

        let missing = r#"{"errorCode":100,"message":"Key not found","cause":"/flags/x","index":8}"#;
        assert!(matches!(
            decode_error(StatusCode::NOT_FOUND, missing),
            SourceError::KeyNotFound(_)
        ));

        assert!(matches!(
            decode_error(StatusCode::BAD_REQUEST, "garbage"),
            SourceError::Malformed(_)
        ));
    }
}
