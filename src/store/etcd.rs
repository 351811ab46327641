//! etcd v3 store over the JSON gateway
//!
//! Keys and values travel base64 encoded. TTLs are implemented with one
//! lease grant per write; compare-and-swap is a single-compare txn.

use crate::config::schema::StoreConfig;
use crate::error::{LayerCacheError, LayerCacheResult};
use crate::store::{KeyValue, KeyValueStore, ScanPage, ScanRequest};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Client for an etcd cluster's `/v3` JSON gateway
pub struct EtcdStore {
    client: reqwest::Client,
    endpoints: Vec<String>,
    credentials: Option<(String, String)>,
    token: RwLock<Option<String>>,
    /// Index of the endpoint that answered last
    current: AtomicUsize,
}

#[derive(Serialize)]
struct RangeRequest {
    key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    range_end: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    limit: Option<i64>,
}

#[derive(Deserialize, Default)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<EtcdKv>,
    #[serde(default)]
    more: bool,
}

#[derive(Deserialize)]
struct EtcdKv {
    key: String,
    #[serde(default)]
    value: String,
}

#[derive(Serialize)]
struct PutRequest {
    key: String,
    value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    lease: Option<String>,
}

#[derive(Serialize)]
struct LeaseGrantRequest {
    #[serde(rename = "TTL")]
    ttl: i64,
}

#[derive(Deserialize, Default)]
struct LeaseGrantResponse {
    #[serde(rename = "ID", default)]
    id: serde_json::Value,
}

#[derive(Serialize)]
struct TxnRequest {
    compare: Vec<Compare>,
    success: Vec<RequestOp>,
}

#[derive(Serialize)]
struct Compare {
    key: String,
    target: &'static str,
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    create_revision: Option<String>,
}

#[derive(Serialize)]
struct RequestOp {
    request_put: PutRequest,
}

#[derive(Deserialize, Default)]
struct TxnResponse {
    #[serde(default)]
    succeeded: bool,
}

#[derive(Serialize)]
struct DeleteRangeRequest {
    key: String,
}

#[derive(Deserialize, Default)]
struct DeleteRangeResponse {
    #[serde(default)]
    deleted: Option<serde_json::Value>,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    name: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthResponse {
    token: String,
}

/// Decode an int64 the gateway may render as string or number
fn int64(value: &serde_json::Value) -> Option<i64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

fn encode(raw: &[u8]) -> String {
    B64.encode(raw)
}

fn decode(key: &str, encoded: &str) -> LayerCacheResult<String> {
    let bytes = B64
        .decode(encoded)
        .map_err(|e| LayerCacheError::CorruptedRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
    String::from_utf8(bytes).map_err(|e| LayerCacheError::CorruptedRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Smallest key greater than every key starting with `prefix`
///
/// An empty prefix maps to `"\0"`, etcd's "to the end of the keyspace".
pub(crate) fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return end;
        }
    }
    vec![0]
}

impl EtcdStore {
    /// Create a client from store configuration
    pub fn new(config: &StoreConfig) -> LayerCacheResult<Self> {
        if config.endpoints.is_empty() {
            return Err(LayerCacheError::ConfigValidation(
                "etcd store requires at least one endpoint".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| LayerCacheError::Internal(format!("building HTTP client: {e}")))?;

        let credentials = match (&config.username, &config.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        };

        Ok(Self {
            client,
            endpoints: config
                .endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            credentials,
            token: RwLock::new(None),
            current: AtomicUsize::new(0),
        })
    }

    async fn auth_token(&self, endpoint: &str) -> LayerCacheResult<Option<String>> {
        let Some((name, password)) = &self.credentials else {
            return Ok(None);
        };

        if let Some(token) = self.token.read().await.clone() {
            return Ok(Some(token));
        }

        let response = self
            .client
            .post(format!("{endpoint}/v3/auth/authenticate"))
            .json(&AuthRequest { name, password })
            .send()
            .await
            .map_err(|e| LayerCacheError::unavailable("authenticate", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(LayerCacheError::StoreResponse {
                operation: "authenticate".to_string(),
                reason: format!("{status}: {body}"),
            });
        }

        let auth: AuthResponse = response
            .json()
            .await
            .map_err(|e| LayerCacheError::unavailable("authenticate", e))?;
        *self.token.write().await = Some(auth.token.clone());
        Ok(Some(auth.token))
    }

    /// POST to the first endpoint that answers, starting from the last good one
    async fn call<B, R>(&self, operation: &str, path: &str, body: &B) -> LayerCacheResult<R>
    where
        B: Serialize + Sync,
        R: DeserializeOwned + Default,
    {
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = None;

        for offset in 0..self.endpoints.len() {
            let index = (start + offset) % self.endpoints.len();
            let endpoint = &self.endpoints[index];

            let token = match self.auth_token(endpoint).await {
                Ok(token) => token,
                Err(e) if e.is_retryable() => {
                    last_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let mut request = self.client.post(format!("{endpoint}{path}")).json(body);
            if let Some(token) = token {
                request = request.header("Authorization", token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!(endpoint = %endpoint, operation, "etcd endpoint unreachable: {}", e);
                    last_error = Some(LayerCacheError::unavailable(operation, e));
                    continue;
                }
            };

            self.current.store(index, Ordering::Relaxed);
            let status = response.status();

            if status == reqwest::StatusCode::UNAUTHORIZED {
                // Token expired; the next call re-authenticates
                *self.token.write().await = None;
                return Err(LayerCacheError::unavailable(operation, "authentication expired"));
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let error = LayerCacheError::StoreResponse {
                    operation: operation.to_string(),
                    reason: format!("{status}: {body}"),
                };
                if status.is_server_error() {
                    last_error = Some(LayerCacheError::unavailable(operation, error));
                    continue;
                }
                return Err(error);
            }

            let text = response
                .text()
                .await
                .map_err(|e| LayerCacheError::unavailable(operation, e))?;
            if text.trim().is_empty() {
                return Ok(R::default());
            }
            return serde_json::from_str(&text).map_err(|e| LayerCacheError::StoreResponse {
                operation: operation.to_string(),
                reason: format!("unexpected response: {e}"),
            });
        }

        Err(last_error.unwrap_or_else(|| LayerCacheError::unavailable(operation, "no endpoints")))
    }

    async fn grant_lease(&self, ttl: Duration) -> LayerCacheResult<String> {
        let response: LeaseGrantResponse = self
            .call(
                "lease grant",
                "/v3/lease/grant",
                &LeaseGrantRequest {
                    ttl: ttl.as_secs().max(1) as i64,
                },
            )
            .await?;

        int64(&response.id)
            .map(|id| id.to_string())
            .ok_or_else(|| LayerCacheError::StoreResponse {
                operation: "lease grant".to_string(),
                reason: "response carried no lease ID".to_string(),
            })
    }
}

#[async_trait]
impl KeyValueStore for EtcdStore {
    async fn get(&self, key: &str) -> LayerCacheResult<Option<String>> {
        let response: RangeResponse = self
            .call(
                "get",
                "/v3/kv/range",
                &RangeRequest {
                    key: encode(key.as_bytes()),
                    range_end: None,
                    limit: None,
                },
            )
            .await?;

        response
            .kvs
            .first()
            .map(|kv| decode(key, &kv.value))
            .transpose()
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> LayerCacheResult<()> {
        let lease = match ttl {
            Some(ttl) => Some(self.grant_lease(ttl).await?),
            None => None,
        };

        let _: serde_json::Value = self
            .call(
                "put",
                "/v3/kv/put",
                &PutRequest {
                    key: encode(key.as_bytes()),
                    value: encode(value.as_bytes()),
                    lease,
                },
            )
            .await?;
        debug!(key = %key, "etcd put");
        Ok(())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new_value: &str,
    ) -> LayerCacheResult<bool> {
        let compare = match expected {
            Some(value) => Compare {
                key: encode(key.as_bytes()),
                target: "VALUE",
                result: "EQUAL",
                value: Some(encode(value.as_bytes())),
                create_revision: None,
            },
            None => Compare {
                key: encode(key.as_bytes()),
                target: "CREATE",
                result: "EQUAL",
                value: None,
                create_revision: Some("0".to_string()),
            },
        };

        let response: TxnResponse = self
            .call(
                "compare-and-swap",
                "/v3/kv/txn",
                &TxnRequest {
                    compare: vec![compare],
                    success: vec![RequestOp {
                        request_put: PutRequest {
                            key: encode(key.as_bytes()),
                            value: encode(new_value.as_bytes()),
                            lease: None,
                        },
                    }],
                },
            )
            .await?;

        Ok(response.succeeded)
    }

    async fn delete(&self, key: &str) -> LayerCacheResult<bool> {
        let response: DeleteRangeResponse = self
            .call(
                "delete",
                "/v3/kv/deleterange",
                &DeleteRangeRequest {
                    key: encode(key.as_bytes()),
                },
            )
            .await?;

        Ok(response.deleted.as_ref().and_then(int64).unwrap_or(0) > 0)
    }

    async fn scan(&self, request: ScanRequest) -> LayerCacheResult<ScanPage> {
        let start = match &request.cursor {
            Some(cursor) => {
                let mut next = cursor.as_bytes().to_vec();
                next.push(0);
                next
            }
            None if request.prefix.is_empty() => vec![0],
            None => request.prefix.as_bytes().to_vec(),
        };
        let end = prefix_range_end(request.prefix.as_bytes());

        let response: RangeResponse = self
            .call(
                "scan",
                "/v3/kv/range",
                &RangeRequest {
                    key: encode(&start),
                    range_end: Some(encode(&end)),
                    limit: Some(request.limit.max(1) as i64),
                },
            )
            .await?;

        let mut entries = Vec::with_capacity(response.kvs.len());
        for kv in &response.kvs {
            let key = decode(&request.prefix, &kv.key)?;
            let value = decode(&key, &kv.value)?;
            entries.push(KeyValue { key, value });
        }

        let next_cursor = if response.more {
            entries.last().map(|kv| kv.key.clone())
        } else {
            None
        };

        Ok(ScanPage {
            entries,
            next_cursor,
        })
    }

    fn backend_name(&self) -> &'static str {
        "etcd"
    }
}
