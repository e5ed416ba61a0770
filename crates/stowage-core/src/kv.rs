use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use stowage_types::{Result, StowageError};

/// String key-value store with per-entry TTL.
///
/// Backs the session store and the entity-key cache. The remote
/// implementation is an external cache service; [`MemoryKv`] is both the
/// in-process fallback and the test double.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Reset the TTL of an existing entry. Missing keys are a no-op.
    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Cheap liveness check used by `/health`.
    async fn ping(&self) -> Result<()>;
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process KV map with lazy expiry.
///
/// Expired entries are dropped on access; [`MemoryKv::sweep`] exists for the
/// periodic background pass so abandoned keys do not accumulate.
pub struct MemoryKv {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.lock().values().filter(|e| e.expires_at > now).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(e) if e.expires_at > Instant::now() => Ok(Some(e.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.lock().insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock().remove(key);
        Ok(())
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.lock();
        if let Some(e) = entries.get_mut(key) {
            e.expires_at = Instant::now() + ttl;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Remote cache client: GET/PUT/DELETE of `/keys/{key}`, TTL as a query
/// parameter, optional bearer auth.
pub struct RestKv {
    client: reqwest::Client,
    base_url: String,
}

impl RestKv {
    pub fn new(endpoint: &str, token: Option<&str>, timeout: Duration) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|_| {
                    StowageError::Config("cache token contains invalid characters".into())
                })?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| StowageError::Config(format!("failed to build cache client: {e}")))?;
        Ok(Self {
            client,
            base_url: endpoint.trim_end_matches('/').to_string(),
        })
    }

    fn key_url(&self, key: &str) -> String {
        // Keys contain `:` namespaces; keep them readable but escaped.
        let encoded: String = key
            .chars()
            .map(|c| match c {
                'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | ':' => c.to_string(),
                other => format!("%{:02X}", other as u32),
            })
            .collect();
        format!("{}/keys/{}", self.base_url, encoded)
    }

    fn map_error(op: &str, e: reqwest::Error) -> StowageError {
        if e.is_timeout() {
            StowageError::Timeout(format!("cache {op}"))
        } else {
            StowageError::Connection(format!("cache {op}: {e}"))
        }
    }
}

#[async_trait]
impl KvStore for RestKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let resp = self
            .client
            .get(self.key_url(key))
            .send()
            .await
            .map_err(|e| Self::map_error("get", e))?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(StowageError::Connection(format!(
                "cache get: HTTP {}",
                resp.status()
            )));
        }
        let value = resp
            .text()
            .await
            .map_err(|e| Self::map_error("get", e))?;
        Ok(Some(value))
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let resp = self
            .client
            .put(self.key_url(key))
            .query(&[("ttl_secs", ttl.as_secs())])
            .body(value.to_string())
            .send()
            .await
            .map_err(|e| Self::map_error("put", e))?;
        if !resp.status().is_success() {
            return Err(StowageError::Connection(format!(
                "cache put: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let resp = self
            .client
            .delete(self.key_url(key))
            .send()
            .await
            .map_err(|e| Self::map_error("delete", e))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(StowageError::Connection(format!(
                "cache delete: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn extend_ttl(&self, key: &str, ttl: Duration) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/touch", self.key_url(key)))
            .query(&[("ttl_secs", ttl.as_secs())])
            .send()
            .await
            .map_err(|e| Self::map_error("extend_ttl", e))?;
        if !resp.status().is_success() && resp.status().as_u16() != 404 {
            return Err(StowageError::Connection(format!(
                "cache extend_ttl: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let resp = self
            .client
            .get(format!("{}/healthz", self.base_url))
            .send()
            .await
            .map_err(|e| Self::map_error("ping", e))?;
        if !resp.status().is_success() {
            return Err(StowageError::Connection(format!(
                "cache ping: HTTP {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_put_get_delete() {
        let kv = MemoryKv::new();
        kv.put("session:k1", "v1", Duration::from_secs(60)).await.unwrap();
        assert_eq!(kv.get("session:k1").await.unwrap().as_deref(), Some("v1"));

        kv.delete("session:k1").await.unwrap();
        assert_eq!(kv.get("session:k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_entries_expire() {
        let kv = MemoryKv::new();
        kv.put("k", "v", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_extend_ttl_keeps_entry_alive() {
        let kv = MemoryKv::new();
        kv.put("k", "v", Duration::from_millis(30)).await.unwrap();
        kv.extend_ttl("k", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn memory_sweep_removes_expired() {
        let kv = MemoryKv::new();
        kv.put("a", "1", Duration::from_millis(5)).await.unwrap();
        kv.put("b", "2", Duration::from_secs(60)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(kv.sweep(), 1);
        assert_eq!(kv.len(), 1);
    }

    #[test]
    fn rest_kv_escapes_keys() {
        let kv = RestKv::new("http://cache.local/", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            kv.key_url("session:abc-123"),
            "http://cache.local/keys/session:abc-123"
        );
        assert_eq!(kv.key_url("a b"), "http://cache.local/keys/a%20b");
    }
}
