use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use stowage_types::{EntityKey, Result, StowageError};

use crate::client::LedgerClient;
use crate::entity::{Entity, EntityDraft, QueryFilter, QueryPage};

/// Configuration for the HTTP ledger client.
#[derive(Debug, Clone)]
pub struct HttpLedgerConfig {
    /// Base URL of the ledger gateway, e.g. `https://ledger.example.com/v1`.
    pub endpoint: String,
    /// Write credential. Read-only handles omit it.
    pub private_key: Option<String>,
    /// Per-request deadline.
    pub timeout: Duration,
    /// TCP connect deadline.
    pub connect_timeout: Duration,
}

/// `reqwest`-backed ledger handle speaking the gateway's JSON API.
///
/// Retries are not built in; callers go through the pool's retry wrapper.
pub struct HttpLedger {
    client: reqwest::Client,
    base_url: String,
    writable: bool,
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    entities: &'a [EntityDraft],
}

#[derive(Deserialize)]
struct CreateResponse {
    keys: Vec<EntityKey>,
}

#[derive(Serialize)]
struct QueryRequest<'a> {
    #[serde(flatten)]
    filter: &'a QueryFilter,
    #[serde(skip_serializing_if = "Option::is_none")]
    cursor: Option<&'a str>,
}

#[derive(Deserialize)]
struct ChainHead {
    block: u64,
}

#[derive(Deserialize)]
struct ChainTiming {
    block_seconds: f64,
}

impl HttpLedger {
    pub fn new(config: &HttpLedgerConfig) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        if let Some(key) = &config.private_key {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| {
                    StowageError::Config("ledger private key contains invalid characters".into())
                })?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| StowageError::Config(format!("failed to build ledger client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            writable: config.private_key.is_some(),
        })
    }

    fn map_send_error(op: &str, e: reqwest::Error) -> StowageError {
        if e.is_timeout() {
            StowageError::Timeout(format!("ledger {op}"))
        } else if e.is_connect() {
            StowageError::Connection(format!("ledger {op}: {e}"))
        } else {
            StowageError::LedgerUnavailable(format!("ledger {op}: {e}"))
        }
    }

    /// Map a non-success status. 429 and 5xx are transient; everything else
    /// is a permanent ledger-side rejection.
    async fn map_status(op: &str, resp: reqwest::Response) -> StowageError {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let excerpt: String = body.chars().take(200).collect();
        if status.as_u16() == 429 || status.is_server_error() {
            StowageError::LedgerUnavailable(format!("ledger {op}: HTTP {status}: {excerpt}"))
        } else {
            StowageError::Internal(format!("ledger {op}: HTTP {status}: {excerpt}"))
        }
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        op: &str,
        resp: reqwest::Response,
    ) -> Result<T> {
        resp.json::<T>()
            .await
            .map_err(|e| StowageError::Internal(format!("ledger {op}: bad response body: {e}")))
    }
}

#[async_trait]
impl LedgerClient for HttpLedger {
    async fn create_entities(&self, drafts: &[EntityDraft]) -> Result<Vec<EntityKey>> {
        let url = format!("{}/entities", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&CreateRequest { entities: drafts })
            .send()
            .await
            .map_err(|e| Self::map_send_error("create", e))?;

        if !resp.status().is_success() {
            return Err(Self::map_status("create", resp).await);
        }
        let body: CreateResponse = Self::decode("create", resp).await?;
        if body.keys.len() != drafts.len() {
            return Err(StowageError::Internal(format!(
                "ledger create returned {} keys for {} entities",
                body.keys.len(),
                drafts.len()
            )));
        }
        Ok(body.keys)
    }

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        let url = format!("{}/entities/{}", self.base_url, key);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_send_error("get", e))?;

        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(Self::map_status("get", resp).await);
        }
        Ok(Some(Self::decode("get", resp).await?))
    }

    async fn query(&self, filter: &QueryFilter, cursor: Option<&str>) -> Result<QueryPage> {
        let url = format!("{}/entities/query", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&QueryRequest { filter, cursor })
            .send()
            .await
            .map_err(|e| Self::map_send_error("query", e))?;

        if !resp.status().is_success() {
            return Err(Self::map_status("query", resp).await);
        }
        Self::decode("query", resp).await
    }

    async fn current_block(&self) -> Result<u64> {
        let url = format!("{}/chain/head", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_send_error("head", e))?;

        if !resp.status().is_success() {
            return Err(Self::map_status("head", resp).await);
        }
        let head: ChainHead = Self::decode("head", resp).await?;
        Ok(head.block)
    }

    async fn block_seconds(&self) -> Result<f64> {
        let url = format!("{}/chain/timing", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_send_error("timing", e))?;

        if !resp.status().is_success() {
            return Err(Self::map_status("timing", resp).await);
        }
        let timing: ChainTiming = Self::decode("timing", resp).await?;
        Ok(timing.block_seconds)
    }

    async fn ping(&self) -> Result<()> {
        let url = format!("{}/healthz", self.base_url);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::map_send_error("ping", e))?;

        if !resp.status().is_success() {
            return Err(Self::map_status("ping", resp).await);
        }
        Ok(())
    }

    fn has_write_credentials(&self) -> bool {
        self.writable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(endpoint: &str) -> HttpLedgerConfig {
        HttpLedgerConfig {
            endpoint: endpoint.to_string(),
            private_key: Some("k".into()),
            timeout: Duration::from_millis(200),
            connect_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn trailing_slash_is_normalized() {
        let ledger = HttpLedger::new(&test_config("http://ledger.local/v1/")).unwrap();
        assert_eq!(ledger.base_url, "http://ledger.local/v1");
    }

    #[test]
    fn credentials_gate_the_write_pool() {
        let writable = HttpLedger::new(&test_config("http://ledger.local")).unwrap();
        assert!(writable.has_write_credentials());

        let mut cfg = test_config("http://ledger.local");
        cfg.private_key = None;
        let read_only = HttpLedger::new(&cfg).unwrap();
        assert!(!read_only.has_write_credentials());
    }

    #[test]
    fn invalid_key_characters_are_rejected() {
        let mut cfg = test_config("http://ledger.local");
        cfg.private_key = Some("bad\nkey".into());
        assert!(HttpLedger::new(&cfg).is_err());
    }

    #[tokio::test]
    async fn connection_failure_maps_to_transient_error() {
        // Port 1 is never listening.
        let ledger = HttpLedger::new(&test_config("http://127.0.0.1:1")).unwrap();
        let err = ledger.current_block().await.unwrap_err();
        assert!(err.is_retryable(), "got {err:?}");
    }
}
