use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use stowage_types::{FileId, Result, StowageError};

use crate::chunker::FileMetadata;
use crate::kv::{KvStore, MemoryKv};

/// Primary namespace: serialized sessions keyed by idempotency key.
const SESSION_PREFIX: &str = "session:";
/// Secondary index: file id back to idempotency key. Kept in a distinct
/// namespace so the two key families can never collide.
const FILE_ID_PREFIX: &str = "fileid:";

/// Minimum interval between degraded-cache log lines.
const DEGRADED_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Uploading,
    Completed,
    Failed,
}

/// The stateful record of one in-flight or terminal upload.
///
/// Created at admission; mutated only by the one writer task driving the
/// session; terminal once `status` leaves `Uploading`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadSession {
    pub file_id: FileId,
    pub idempotency_key: String,
    pub metadata: FileMetadata,
    pub chunks_received: BTreeSet<u32>,
    pub completed: bool,
    pub status: SessionStatus,
    pub error: Option<String>,
    pub chunks_uploaded_to_ledger: u32,
    pub total_chunks: u32,
    pub started_at: DateTime<Utc>,
    pub last_chunk_uploaded_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn new(idempotency_key: String, metadata: FileMetadata) -> Self {
        let total_chunks = metadata.chunk_count;
        Self {
            file_id: metadata.file_id,
            idempotency_key,
            metadata,
            chunks_received: BTreeSet::new(),
            completed: false,
            status: SessionStatus::Uploading,
            error: None,
            chunks_uploaded_to_ledger: 0,
            total_chunks,
            started_at: Utc::now(),
            last_chunk_uploaded_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status != SessionStatus::Uploading
    }

    /// Progress snapshot for status endpoints. The remaining-time estimate
    /// uses average seconds per landed chunk and is omitted until the first
    /// chunk lands.
    pub fn progress(&self) -> UploadProgress {
        let uploaded = self.chunks_uploaded_to_ledger;
        let total = self.total_chunks;
        let remaining = total.saturating_sub(uploaded);
        let elapsed = (Utc::now() - self.started_at).num_milliseconds().max(0) as f64 / 1000.0;

        let percentage = if total == 0 {
            100.0
        } else {
            f64::from(uploaded) * 100.0 / f64::from(total)
        };

        let estimated_remaining_seconds = if uploaded > 0 && remaining > 0 {
            let avg = elapsed / f64::from(uploaded);
            Some(avg * f64::from(remaining))
        } else {
            None
        };

        UploadProgress {
            chunks_uploaded: uploaded,
            total_chunks: total,
            percentage,
            remaining_chunks: remaining,
            elapsed_seconds: elapsed,
            estimated_remaining_seconds,
            last_chunk_uploaded_at: self.last_chunk_uploaded_at,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadProgress {
    pub chunks_uploaded: u32,
    pub total_chunks: u32,
    pub percentage: f64,
    pub remaining_chunks: u32,
    pub elapsed_seconds: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_remaining_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_chunk_uploaded_at: Option<DateTime<Utc>>,
}

/// Idempotency-key → session store: remote cache first, in-process fallback.
///
/// Remote failures never fail the caller; they degrade to the memory map and
/// are logged at most once a minute. The memory fallback is authoritative
/// only for sessions it originated.
pub struct SessionStore {
    remote: Option<Arc<dyn KvStore>>,
    memory: MemoryKv,
    ttl: Duration,
    last_degraded_log: Mutex<Option<Instant>>,
}

impl SessionStore {
    pub fn new(remote: Option<Arc<dyn KvStore>>, ttl: Duration) -> Self {
        Self {
            remote,
            memory: MemoryKv::new(),
            ttl,
            last_degraded_log: Mutex::new(None),
        }
    }

    fn session_key(idempotency_key: &str) -> String {
        format!("{SESSION_PREFIX}{idempotency_key}")
    }

    fn file_id_key(file_id: FileId) -> String {
        format!("{FILE_ID_PREFIX}{file_id}")
    }

    fn log_degraded(&self, op: &str, err: &StowageError) {
        let mut last = match self.last_degraded_log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let due = last.map_or(true, |t| t.elapsed() >= DEGRADED_LOG_INTERVAL);
        if due {
            *last = Some(Instant::now());
            warn!("session cache degraded to memory ({op}): {err}");
        }
    }

    /// Persist a session. Best-effort on the remote cache; the memory
    /// fallback takes the write when the cache is unreachable.
    pub async fn put(&self, session: &UploadSession) -> Result<()> {
        let body = serde_json::to_string(session)?;
        let skey = Self::session_key(&session.idempotency_key);
        let fkey = Self::file_id_key(session.file_id);

        if let Some(remote) = &self.remote {
            let wrote = remote.put(&skey, &body, self.ttl).await;
            match wrote {
                Ok(()) => {
                    if let Err(e) = remote
                        .put(&fkey, &session.idempotency_key, self.ttl)
                        .await
                    {
                        self.log_degraded("put index", &e);
                    }
                    return Ok(());
                }
                Err(e) => self.log_degraded("put", &e),
            }
        }

        self.memory.put(&skey, &body, self.ttl).await?;
        self.memory
            .put(&fkey, &session.idempotency_key, self.ttl)
            .await?;
        Ok(())
    }

    pub async fn get(&self, idempotency_key: &str) -> Result<Option<UploadSession>> {
        let skey = Self::session_key(idempotency_key);

        if let Some(remote) = &self.remote {
            match remote.get(&skey).await {
                Ok(Some(body)) => return Ok(Some(serde_json::from_str(&body)?)),
                Ok(None) => {}
                Err(e) => self.log_degraded("get", &e),
            }
        }

        match self.memory.get(&skey).await? {
            Some(body) => Ok(Some(serde_json::from_str(&body)?)),
            None => Ok(None),
        }
    }

    /// Resolve a session through the file-id secondary index.
    pub async fn get_by_file_id(&self, file_id: FileId) -> Result<Option<UploadSession>> {
        let fkey = Self::file_id_key(file_id);

        if let Some(remote) = &self.remote {
            match remote.get(&fkey).await {
                Ok(Some(key)) => {
                    if let Some(session) = self.get(&key).await? {
                        return Ok(Some(session));
                    }
                }
                Ok(None) => {}
                Err(e) => self.log_degraded("get_by_file_id", &e),
            }
        }

        match self.memory.get(&fkey).await? {
            Some(key) => self.get(&key).await,
            None => Ok(None),
        }
    }

    pub async fn extend_ttl(&self, idempotency_key: &str) -> Result<()> {
        let skey = Self::session_key(idempotency_key);
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.extend_ttl(&skey, self.ttl).await {
                self.log_degraded("extend_ttl", &e);
            }
        }
        self.memory.extend_ttl(&skey, self.ttl).await
    }

    pub async fn delete(&self, session: &UploadSession) -> Result<()> {
        let skey = Self::session_key(&session.idempotency_key);
        let fkey = Self::file_id_key(session.file_id);
        if let Some(remote) = &self.remote {
            if let Err(e) = remote.delete(&skey).await {
                self.log_degraded("delete", &e);
            }
            if let Err(e) = remote.delete(&fkey).await {
                self.log_degraded("delete index", &e);
            }
        }
        self.memory.delete(&skey).await?;
        self.memory.delete(&fkey).await
    }

    /// Liveness of the remote cache for `/health`. Memory-only stores are
    /// always healthy.
    pub async fn ping(&self) -> Result<()> {
        match &self.remote {
            Some(remote) => remote.ping().await,
            None => Ok(()),
        }
    }

    /// Expire abandoned fallback entries; driven by a background interval.
    pub fn sweep_memory(&self) -> usize {
        self.memory.sweep()
    }
}
