use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use stowage_ledger::entity::annotation;
use stowage_ledger::{EntityDraft, LedgerClient, LedgerPool, RetryPolicy};
use stowage_types::{EntityKey, FileId, Result, StowageError};

use crate::chunker::{self, Chunk, FileMetadata};
use crate::config::StowageConfig;
use crate::keycache::{EntityKeyCache, EntityKeyIndex};
use crate::quota::QuotaAccountant;
use crate::session::{SessionStatus, SessionStore, UploadSession};

/// Everything the admission path needs to know about one upload attempt.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub payload: Vec<u8>,
    pub original_filename: String,
    pub content_type: String,
    pub owner: Option<String>,
    pub idempotency_key: String,
    pub btl_days: Option<u32>,
    pub user_id: String,
    /// Opaque key that, when it matches the configured one, skips quota.
    pub bypass_key: Option<String>,
}

/// Outcome of admission. `replayed` marks an idempotent re-submission that
/// scheduled no new work.
#[derive(Debug, Clone)]
pub struct InitiateAccepted {
    pub file_id: FileId,
    pub replayed: bool,
}

/// Retry schedules used by the background writer. Overridable so tests can
/// drive the fallback path without real backoff sleeps.
#[derive(Debug, Clone, Copy)]
pub struct WriterPolicies {
    pub batch: RetryPolicy,
    pub single: RetryPolicy,
}

impl Default for WriterPolicies {
    fn default() -> Self {
        Self {
            batch: RetryPolicy::batch(),
            single: RetryPolicy::single(),
        }
    }
}

/// Admission plus the asynchronous batched ledger write pipeline.
pub struct IngestPipeline {
    config: Arc<StowageConfig>,
    sessions: Arc<SessionStore>,
    keycache: Arc<EntityKeyCache>,
    quota: Arc<QuotaAccountant>,
    pool: Arc<LedgerPool>,
    policies: WriterPolicies,
    active_writers: Arc<AtomicUsize>,
}

impl IngestPipeline {
    pub fn new(
        config: Arc<StowageConfig>,
        sessions: Arc<SessionStore>,
        keycache: Arc<EntityKeyCache>,
        quota: Arc<QuotaAccountant>,
        pool: Arc<LedgerPool>,
    ) -> Self {
        Self {
            config,
            sessions,
            keycache,
            quota,
            pool,
            policies: WriterPolicies::default(),
            active_writers: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Replace the writer retry schedules. Exists for tests that exercise
    /// retry exhaustion and fallback without multi-second backoff.
    #[doc(hidden)]
    pub fn set_writer_policies(&mut self, policies: WriterPolicies) {
        self.policies = policies;
    }

    /// Number of background writers that have not reached a terminal state.
    pub fn active_writers(&self) -> usize {
        self.active_writers.load(Relaxed)
    }

    /// Admission: validate, dedupe, chunk, persist the session, and launch
    /// the background writer. Returns as soon as the session exists; ledger
    /// persistence happens behind the returned `file_id`.
    pub async fn initiate_upload(&self, request: UploadRequest) -> Result<InitiateAccepted> {
        if self.pool.is_shutting_down() {
            return Err(StowageError::ShuttingDown);
        }

        if request.payload.is_empty() {
            return Err(StowageError::Validation("payload must not be empty".into()));
        }
        let size = request.payload.len() as u64;
        let max = self.config.limits.max_file_size;
        if size > max {
            return Err(StowageError::TooLarge { size, max });
        }

        if !self.config.limits.content_type_allowed(&request.content_type) {
            return Err(StowageError::UnsupportedType(request.content_type.clone()));
        }

        validate_idempotency_key(&request.idempotency_key)?;
        if let Some(owner) = &request.owner {
            if owner.len() > 100 {
                return Err(StowageError::Validation(
                    "owner must be at most 100 characters".into(),
                ));
            }
        }

        let bypass = self.quota.bypass_allowed(request.bypass_key.as_deref());
        if !bypass {
            self.quota.check(&request.user_id, size).await?;
        }

        // Idempotent replay: an existing session wins, whatever its body was.
        if let Some(existing) = self.sessions.get(&request.idempotency_key).await? {
            debug!(
                idempotency_key = %request.idempotency_key,
                file_id = %existing.file_id,
                "replaying existing upload session"
            );
            return Ok(InitiateAccepted {
                file_id: existing.file_id,
                replayed: true,
            });
        }

        let file_id = FileId::new();
        let btl_days = request.btl_days.unwrap_or(self.config.ledger.default_btl_days);
        let expiration_block = self.pool.expiration_block(btl_days).await?;

        let (metadata, chunks) = chunker::split_payload(
            &request.payload,
            file_id,
            &request.original_filename,
            &request.content_type,
            request.owner.clone(),
            expiration_block,
            btl_days,
            self.config.limits.chunk_size,
        )?;

        let session = UploadSession::new(request.idempotency_key.clone(), metadata.clone());
        self.sessions.put(&session).await?;

        if !bypass {
            self.quota.commit(&request.user_id, size).await;
        }

        let chunk_count = metadata.chunk_count;
        self.spawn_writer(session, metadata, chunks);

        info!(%file_id, size, chunks = chunk_count, "upload admitted");
        Ok(InitiateAccepted {
            file_id,
            replayed: false,
        })
    }

    fn spawn_writer(&self, session: UploadSession, metadata: FileMetadata, chunks: Vec<Chunk>) {
        let writer = SessionWriter {
            sessions: self.sessions.clone(),
            keycache: self.keycache.clone(),
            pool: self.pool.clone(),
            policies: self.policies,
            batch_size: self.config.ledger.batch_size.max(1),
            call_deadline: self.config.ledger.timeout(),
            session,
            metadata,
            chunks,
        };

        let active = self.active_writers.clone();
        active.fetch_add(1, Relaxed);
        tokio::spawn(async move {
            writer.run().await;
            active.fetch_sub(1, Relaxed);
        });
    }

    /// Best-effort drain: wait until running writers finish or the deadline
    /// passes. Used on shutdown before the pool stops handing out handles.
    pub async fn drain_writers(&self, deadline: Duration) {
        let start = std::time::Instant::now();
        while self.active_writers() > 0 && start.elapsed() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let remaining = self.active_writers();
        if remaining > 0 {
            warn!(remaining, "shutdown with writers still in flight");
        }
    }
}

fn validate_idempotency_key(key: &str) -> Result<()> {
    let len = key.len();
    if !(8..=128).contains(&len) {
        return Err(StowageError::Validation(
            "idempotency key must be 8-128 characters".into(),
        ));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(StowageError::Validation(
            "idempotency key must match [A-Za-z0-9_-]".into(),
        ));
    }
    Ok(())
}

/// Builds the metadata entity draft per the persisted wire format.
fn metadata_draft(metadata: &FileMetadata) -> Result<EntityDraft> {
    let payload = serde_json::to_vec(&serde_json::json!({
        "file_id": metadata.file_id,
        "original_filename": metadata.original_filename,
        "content_type": metadata.content_type,
        "file_extension": metadata.file_extension,
        "total_size": metadata.total_size,
        "chunk_count": metadata.chunk_count,
        "checksum": metadata.checksum,
        "created_at": metadata.created_at,
        "btl_days": metadata.btl_days,
        "owner": metadata.owner,
    }))?;

    let mut draft = EntityDraft::new(payload, metadata.expiration_block)
        .with_string(annotation::TYPE, annotation::TYPE_METADATA)
        .with_string(annotation::FILE_ID, metadata.file_id.to_string())
        .with_string(annotation::ORIGINAL_FILENAME, &metadata.original_filename)
        .with_string(annotation::CONTENT_TYPE, &metadata.content_type)
        .with_string(annotation::FILE_EXTENSION, &metadata.file_extension)
        .with_string(annotation::CHECKSUM, &metadata.checksum)
        .with_numeric(annotation::TOTAL_SIZE, metadata.total_size)
        .with_numeric(annotation::CHUNK_COUNT, u64::from(metadata.chunk_count))
        .with_numeric(annotation::EXPIRATION_BLOCK, metadata.expiration_block)
        .with_numeric(annotation::BTL_DAYS, u64::from(metadata.btl_days));
    if let Some(owner) = &metadata.owner {
        draft = draft.with_string(annotation::OWNER, owner);
    }
    Ok(draft)
}

/// Builds a chunk entity draft: gzip payload, 0-based `chunk_index`.
fn chunk_draft(chunk: &Chunk) -> EntityDraft {
    EntityDraft::new(chunk.bytes.clone(), chunk.expiration_block)
        .with_string(annotation::TYPE, annotation::TYPE_CHUNK)
        .with_string(annotation::FILE_ID, chunk.file_id.to_string())
        .with_string(annotation::CHUNK_INDEX, chunk.chunk_index.to_string())
        .with_string(annotation::CHECKSUM, &chunk.checksum)
        .with_string(annotation::CREATED_AT, chunk.created_at.to_rfc3339())
        .with_numeric(annotation::CHUNK_SIZE, chunk.original_size)
        .with_numeric(annotation::EXPIRATION_BLOCK, chunk.expiration_block)
}

/// Writer phase: batches first, individual writes once batching is exhausted.
/// The transition is an explicit state, not an error handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterPhase {
    Batch,
    Fallback,
}

/// The single task that moves one session's entities onto the ledger.
///
/// Owns the session record for its lifetime: nothing else mutates it, so
/// readers observe monotonically non-decreasing progress.
struct SessionWriter {
    sessions: Arc<SessionStore>,
    keycache: Arc<EntityKeyCache>,
    pool: Arc<LedgerPool>,
    policies: WriterPolicies,
    batch_size: usize,
    call_deadline: Duration,
    session: UploadSession,
    metadata: FileMetadata,
    chunks: Vec<Chunk>,
}

impl SessionWriter {
    async fn run(mut self) {
        let file_id = self.metadata.file_id;
        match self.write_all().await {
            Ok(()) => {
                let index = EntityKeyIndex {
                    metadata_key: self.metadata.ledger_key.clone(),
                    chunk_keys: self
                        .chunks
                        .iter()
                        .filter_map(|c| c.ledger_key.clone())
                        .collect(),
                };
                if let Err(e) = self.keycache.put(file_id, &index).await {
                    warn!(%file_id, "failed to publish entity-key index: {e}");
                }

                self.session.status = SessionStatus::Completed;
                self.session.completed = true;
                self.persist_session().await;
                info!(%file_id, chunks = self.chunks.len(), "upload persisted to ledger");
            }
            Err(e) => {
                error!(%file_id, "upload failed terminally: {e}");
                self.session.status = SessionStatus::Failed;
                self.session.error = Some(e.to_string());
                self.persist_session().await;
            }
        }
    }

    async fn write_all(&mut self) -> Result<()> {
        let mut phase = WriterPhase::Batch;
        let mut next_chunk = 0usize;

        while next_chunk < self.chunks.len() || self.metadata.ledger_key.is_none() {
            match phase {
                WriterPhase::Batch => {
                    let group_end = (next_chunk + self.batch_size).min(self.chunks.len());
                    match self.write_batch(next_chunk, group_end).await {
                        Ok(()) => next_chunk = group_end,
                        Err(e) => {
                            warn!(
                                file_id = %self.metadata.file_id,
                                from = next_chunk,
                                "batch writes exhausted, falling back to individual writes: {e}"
                            );
                            phase = WriterPhase::Fallback;
                        }
                    }
                }
                WriterPhase::Fallback => {
                    if self.metadata.ledger_key.is_none() {
                        let key = self.write_one(metadata_draft(&self.metadata)?).await?;
                        self.metadata.ledger_key = Some(key.clone());
                        self.session.metadata.ledger_key = Some(key);
                        self.persist_session().await;
                    }
                    while next_chunk < self.chunks.len() {
                        let draft = chunk_draft(&self.chunks[next_chunk]);
                        let key = self.write_one(draft).await?;
                        self.record_chunk_keys(next_chunk, next_chunk + 1, vec![key]);
                        self.persist_session().await;
                        next_chunk += 1;
                    }
                }
            }
        }
        Ok(())
    }

    /// One combined batch: metadata rides with the first chunk group; later
    /// groups are chunk-only. The ledger returns keys in draft order.
    async fn write_batch(&mut self, from: usize, to: usize) -> Result<()> {
        let with_metadata = self.metadata.ledger_key.is_none();
        let mut drafts = Vec::with_capacity(to - from + usize::from(with_metadata));
        if with_metadata {
            drafts.push(metadata_draft(&self.metadata)?);
        }
        for chunk in &self.chunks[from..to] {
            drafts.push(chunk_draft(chunk));
        }

        let keys = self.create_entities(drafts, self.policies.batch).await?;

        let mut keys = keys.into_iter();
        if with_metadata {
            let key = keys.next().ok_or_else(|| {
                StowageError::Internal("ledger batch returned no metadata key".into())
            })?;
            self.metadata.ledger_key = Some(key.clone());
            self.session.metadata.ledger_key = Some(key);
        }
        self.record_chunk_keys(from, to, keys.collect());
        self.persist_session().await;
        Ok(())
    }

    async fn write_one(&self, draft: EntityDraft) -> Result<EntityKey> {
        let keys = self.create_entities(vec![draft], self.policies.single).await?;
        keys.into_iter()
            .next()
            .ok_or_else(|| StowageError::Internal("ledger write returned no key".into()))
    }

    async fn create_entities(
        &self,
        drafts: Vec<EntityDraft>,
        policy: RetryPolicy,
    ) -> Result<Vec<EntityKey>> {
        let deadline = self.call_deadline;
        self.pool
            .with_write("create_entities", policy, move |client: Arc<dyn LedgerClient>| {
                let drafts = drafts.clone();
                async move {
                    tokio::time::timeout(deadline, client.create_entities(&drafts))
                        .await
                        .unwrap_or_else(|_| {
                            Err(StowageError::Timeout("ledger create call".into()))
                        })
                }
            })
            .await
    }

    /// Write returned keys back into the chunk records and advance progress.
    fn record_chunk_keys(&mut self, from: usize, to: usize, keys: Vec<EntityKey>) {
        for (chunk, key) in self.chunks[from..to].iter_mut().zip(keys) {
            chunk.ledger_key = Some(key);
            self.session.chunks_received.insert(chunk.chunk_index);
        }
        self.session.chunks_uploaded_to_ledger = (to as u32).min(self.session.total_chunks);
        self.session.last_chunk_uploaded_at = Some(Utc::now());
    }

    /// Session persistence is best-effort: progress visibility must never
    /// fail the upload itself.
    async fn persist_session(&self) {
        if let Err(e) = self.sessions.put(&self.session).await {
            warn!(file_id = %self.session.file_id, "failed to persist session progress: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_charset_and_length() {
        assert!(validate_idempotency_key("abcd-1234").is_ok());
        assert!(validate_idempotency_key("A_b-8chars").is_ok());
        assert!(validate_idempotency_key(&"k".repeat(128)).is_ok());

        assert!(validate_idempotency_key("short").is_err());
        assert!(validate_idempotency_key(&"k".repeat(129)).is_err());
        assert!(validate_idempotency_key("bad key!").is_err());
        assert!(validate_idempotency_key("päivä-key").is_err());
    }

    #[test]
    fn metadata_draft_carries_wire_annotations() {
        let (metadata, _) = chunker::split_payload(
            b"hello",
            FileId::new(),
            "note.txt",
            "text/plain",
            Some("alice".into()),
            500,
            7,
            4,
        )
        .unwrap();

        let draft = metadata_draft(&metadata).unwrap();
        assert_eq!(
            draft.string_annotation(annotation::TYPE),
            Some(annotation::TYPE_METADATA)
        );
        assert_eq!(draft.string_annotation(annotation::FILE_EXTENSION), Some("txt"));
        assert_eq!(draft.string_annotation(annotation::OWNER), Some("alice"));
        assert!(draft
            .numeric_annotations
            .contains(&("chunk_count".to_string(), 2)));
        assert!(draft
            .numeric_annotations
            .contains(&("btl_days".to_string(), 7)));

        let payload: serde_json::Value = serde_json::from_slice(&draft.payload).unwrap();
        assert_eq!(payload["total_size"], 5);
        assert_eq!(payload["checksum"], metadata.checksum.as_str());
    }

    #[test]
    fn chunk_draft_uses_zero_based_index() {
        let (_, chunks) = chunker::split_payload(
            b"0123456789",
            FileId::new(),
            "d.bin",
            "application/octet-stream",
            None,
            500,
            7,
            4,
        )
        .unwrap();

        let draft = chunk_draft(&chunks[0]);
        assert_eq!(draft.string_annotation(annotation::CHUNK_INDEX), Some("0"));
        assert_eq!(draft.payload, chunks[0].bytes);
        assert!(draft
            .numeric_annotations
            .contains(&("chunk_size".to_string(), 4)));

        let last = chunk_draft(&chunks[2]);
        assert_eq!(last.string_annotation(annotation::CHUNK_INDEX), Some("2"));
        assert!(last
            .numeric_annotations
            .contains(&("chunk_size".to_string(), 2)));
    }
}
