use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use stowage_ledger::pool::{HandleFactory, PoolStats};
use stowage_ledger::rpc::{HttpLedger, HttpLedgerConfig};
use stowage_ledger::{LedgerClient, LedgerPool, MemoryLedger, PoolConfig, PoolKind};
use stowage_types::{EntityKey, FileId, Result, StowageError};

use crate::config::{StorageMode, StowageConfig};
use crate::ingest::{IngestPipeline, InitiateAccepted, UploadRequest, WriterPolicies};
use crate::keycache::EntityKeyCache;
use crate::kv::{KvStore, MemoryKv, RestKv};
use crate::query::{FileSummary, QueryService};
use crate::quota::{QuotaAccountant, QuotaStatus};
use crate::retrieve::{RetrievePipeline, RetrievedFile};
use crate::session::{SessionStatus, SessionStore, UploadProgress, UploadSession};

/// Interval of the fallback-map expiry sweep.
const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// Metadata plus entity-key detail for the info endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub file_id: FileId,
    pub original_filename: String,
    pub content_type: String,
    pub file_extension: String,
    pub total_size: u64,
    pub chunk_count: u32,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub btl_days: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub metadata_entity_key: Option<EntityKey>,
    pub chunk_entity_keys: Vec<EntityKey>,
    pub total_blockchain_entities: usize,
}

/// Entity keys alone, for the entities endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct FileEntities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_entity_key: Option<EntityKey>,
    pub chunk_entity_keys: Vec<EntityKey>,
    pub total_entities: usize,
}

/// Session state as reported by the status endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct StatusView {
    pub file_id: FileId,
    pub idempotency_key: String,
    pub status: SessionStatus,
    pub completed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub progress: UploadProgress,
}

impl StatusView {
    fn from_session(session: &UploadSession) -> Self {
        Self {
            file_id: session.file_id,
            idempotency_key: session.idempotency_key.clone(),
            status: session.status,
            completed: session.completed,
            error: session.error.clone(),
            progress: session.progress(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceHealth {
    Up,
    Down,
}

/// Health report: reachability and correctness are reported separately, so
/// the transport always answers 200 with this in the body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub services: HealthServices,
    pub pools: HealthPools,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthServices {
    pub ledger: ServiceHealth,
    pub cache: ServiceHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthPools {
    pub read: PoolStats,
    pub write: PoolStats,
}

/// The composition root: one instance wired at boot owns every component and
/// exposes the request-level operations any transport can drive.
pub struct Stowage {
    config: Arc<StowageConfig>,
    pool: Arc<LedgerPool>,
    sessions: Arc<SessionStore>,
    quota: Arc<QuotaAccountant>,
    ingest: IngestPipeline,
    retrieve: RetrievePipeline,
    query: QueryService,
}

impl Stowage {
    /// Wire the service per `config.ledger.storage_mode`.
    pub async fn new(config: StowageConfig) -> Result<Arc<Self>> {
        match config.ledger.storage_mode {
            StorageMode::Memory => {
                Self::with_memory_ledger(config, Arc::new(MemoryLedger::new())).await
            }
            StorageMode::Ledger => {
                if config.ledger.endpoint.is_empty() {
                    return Err(StowageError::Config(
                        "ledger.endpoint is required when storage_mode = ledger".into(),
                    ));
                }
                let ledger_config = HttpLedgerConfig {
                    endpoint: config.ledger.endpoint.clone(),
                    private_key: config.ledger.private_key.clone(),
                    timeout: config.ledger.timeout(),
                    connect_timeout: Duration::from_millis(config.pools.pool_connect_timeout_ms),
                };
                // One validated prototype backs every pooled handle; reqwest
                // multiplexes connections underneath.
                let prototype: Arc<dyn LedgerClient> = Arc::new(HttpLedger::new(&ledger_config)?);
                let factory: HandleFactory = Arc::new(move || prototype.clone());
                Self::build(config, factory).await
            }
        }
    }

    /// Wire the service around a caller-supplied in-memory ledger. Used by
    /// memory mode and by tests that inject faults.
    pub async fn with_memory_ledger(
        config: StowageConfig,
        ledger: Arc<MemoryLedger>,
    ) -> Result<Arc<Self>> {
        let factory: HandleFactory = Arc::new(move || ledger.clone() as Arc<dyn LedgerClient>);
        Self::build(config, factory).await
    }

    /// As [`Stowage::with_memory_ledger`], with writer retry schedules
    /// overridden. Exists for tests that exercise retry exhaustion without
    /// real backoff sleeps.
    #[doc(hidden)]
    pub async fn with_memory_ledger_and_policies(
        config: StowageConfig,
        ledger: Arc<MemoryLedger>,
        policies: WriterPolicies,
    ) -> Result<Arc<Self>> {
        let factory: HandleFactory = Arc::new(move || ledger.clone() as Arc<dyn LedgerClient>);
        let mut service = Self::build_parts(config, factory).await?;
        service.ingest.set_writer_policies(policies);
        Ok(Self::finish(service))
    }

    async fn build(config: StowageConfig, factory: HandleFactory) -> Result<Arc<Self>> {
        let service = Self::build_parts(config, factory).await?;
        Ok(Self::finish(service))
    }

    fn finish(service: Self) -> Arc<Self> {
        let service = Arc::new(service);
        service.clone().spawn_session_sweep();
        service
    }

    async fn build_parts(config: StowageConfig, factory: HandleFactory) -> Result<Self> {
        let config = Arc::new(config);

        let pool = LedgerPool::new(
            PoolConfig {
                read_max: config.pools.read_pool_max,
                write_max: config.pools.write_pool_max,
                idle_timeout: Duration::from_millis(config.pools.pool_idle_ms),
                health_interval: Duration::from_millis(config.pools.pool_health_ms),
                acquire_timeout: Duration::from_millis(config.pools.pool_connect_timeout_ms),
                blocks_per_day: config.ledger.blocks_per_day,
            },
            factory,
        )
        .await;

        let remote: Option<Arc<dyn KvStore>> = match &config.cache.endpoint {
            Some(endpoint) => Some(Arc::new(RestKv::new(
                endpoint,
                config.cache.token.as_deref(),
                Duration::from_secs(5),
            )?)),
            None => None,
        };

        let sessions = Arc::new(SessionStore::new(
            remote.clone(),
            Duration::from_secs(config.cache.session_ttl_secs),
        ));
        let keycache_store: Arc<dyn KvStore> = match remote {
            Some(store) => store,
            None => Arc::new(MemoryKv::new()),
        };
        let keycache = Arc::new(EntityKeyCache::new(
            keycache_store,
            Duration::from_secs(config.cache.entity_keys_ttl_secs),
        ));

        let ledger_backed = config.ledger.storage_mode == StorageMode::Ledger;
        let quota = Arc::new(QuotaAccountant::new(
            config.quota.clone(),
            ledger_backed.then(|| pool.clone()),
        ));

        let ingest = IngestPipeline::new(
            config.clone(),
            sessions.clone(),
            keycache.clone(),
            quota.clone(),
            pool.clone(),
        );
        let retrieve = RetrievePipeline::new(keycache.clone(), pool.clone());
        let query = QueryService::new(pool.clone());

        Ok(Self {
            config,
            pool,
            sessions,
            quota,
            ingest,
            retrieve,
            query,
        })
    }

    fn spawn_session_sweep(self: Arc<Self>) {
        let service = Arc::downgrade(&self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SESSION_SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(service) = service.upgrade() else { return };
                if service.pool.is_shutting_down() {
                    return;
                }
                let swept = service.sessions.sweep_memory();
                if swept > 0 {
                    info!(swept, "swept expired fallback sessions");
                }
            }
        });
    }

    // --- Request-level operations ---

    /// Admission under the request deadline; the background writer is not
    /// bound by it.
    pub async fn initiate_upload(&self, request: UploadRequest) -> Result<InitiateAccepted> {
        let deadline = Duration::from_secs(self.config.limits.request_deadline_secs);
        tokio::time::timeout(deadline, self.ingest.initiate_upload(request))
            .await
            .unwrap_or_else(|_| Err(StowageError::Timeout("upload admission".into())))
    }

    pub async fn get_file(&self, file_id: FileId) -> Result<RetrievedFile> {
        self.retrieve.get_file(file_id).await
    }

    pub async fn file_info(&self, file_id: FileId) -> Result<FileInfo> {
        let index = self.retrieve.fetch_entity_index(file_id).await?;
        let metadata = self.retrieve.fetch_metadata(file_id, Some(&index)).await?;

        // Block height to wall clock via the cached block duration.
        let current = self.pool.current_block().await.unwrap_or(0);
        let secs_left = (metadata.expiration_block.saturating_sub(current)) as f64
            * self.pool.cached_block_seconds();
        let expires_at = Utc::now() + chrono::Duration::seconds(secs_left as i64);

        let total = index.total_entities();
        Ok(FileInfo {
            file_id: metadata.file_id,
            original_filename: metadata.original_filename,
            content_type: metadata.content_type,
            file_extension: metadata.file_extension,
            total_size: metadata.total_size,
            chunk_count: metadata.chunk_count,
            checksum: metadata.checksum,
            created_at: metadata.created_at,
            expires_at,
            btl_days: metadata.btl_days,
            owner: metadata.owner,
            metadata_entity_key: index.metadata_key,
            chunk_entity_keys: index.chunk_keys,
            total_blockchain_entities: total,
        })
    }

    pub async fn file_entities(&self, file_id: FileId) -> Result<FileEntities> {
        let index = self.retrieve.fetch_entity_index(file_id).await?;
        let total = index.total_entities();
        Ok(FileEntities {
            metadata_entity_key: index.metadata_key,
            chunk_entity_keys: index.chunk_keys,
            total_entities: total,
        })
    }

    pub async fn status_by_file_id(&self, file_id: FileId) -> Result<StatusView> {
        match self.sessions.get_by_file_id(file_id).await? {
            Some(session) => Ok(StatusView::from_session(&session)),
            None => Err(StowageError::SessionNotFound(file_id.to_string())),
        }
    }

    pub async fn status_by_key(&self, idempotency_key: &str) -> Result<StatusView> {
        match self.sessions.get(idempotency_key).await? {
            Some(session) => Ok(StatusView::from_session(&session)),
            None => Err(StowageError::SessionNotFound(idempotency_key.to_string())),
        }
    }

    pub async fn files_by_owner(&self, owner: &str) -> Result<Vec<FileSummary>> {
        self.query.by_owner(owner).await
    }

    pub async fn files_by_extension(&self, extension: &str) -> Result<Vec<FileSummary>> {
        self.query.by_extension(extension).await
    }

    pub async fn files_by_content_type(&self, content_type: &str) -> Result<Vec<FileSummary>> {
        self.query.by_content_type(content_type).await
    }

    pub async fn quota_status(&self, user_id: &str) -> QuotaStatus {
        self.quota.usage(user_id).await
    }

    /// Always succeeds; component state lives in the body.
    pub async fn health(&self) -> HealthSnapshot {
        let probe_deadline = Duration::from_secs(2);
        let (ledger, cache) = tokio::join!(
            tokio::time::timeout(probe_deadline, self.pool.ping()),
            tokio::time::timeout(probe_deadline, self.sessions.ping()),
        );
        let ledger = match ledger {
            Ok(Ok(())) => ServiceHealth::Up,
            _ => ServiceHealth::Down,
        };
        let cache = match cache {
            Ok(Ok(())) => ServiceHealth::Up,
            _ => ServiceHealth::Down,
        };

        HealthSnapshot {
            status: if ledger == ServiceHealth::Up && cache == ServiceHealth::Up {
                "ok"
            } else {
                "degraded"
            },
            timestamp: Utc::now(),
            services: HealthServices { ledger, cache },
            pools: HealthPools {
                read: self.pool.stats(PoolKind::Read),
                write: self.pool.stats(PoolKind::Write),
            },
        }
    }

    pub fn active_writers(&self) -> usize {
        self.ingest.active_writers()
    }

    /// Drain in-flight writers best-effort, then stop handing out ledger
    /// handles.
    pub async fn shutdown(&self, drain_deadline: Duration) {
        info!("stowage shutting down");
        self.ingest.drain_writers(drain_deadline).await;
        self.pool.shutdown();
        if self.active_writers() > 0 {
            warn!(
                remaining = self.active_writers(),
                "writers abandoned at shutdown"
            );
        }
    }
}
