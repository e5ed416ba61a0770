use std::sync::Arc;

use futures_util::future::try_join_all;
use tracing::debug;

use stowage_ledger::entity::annotation;
use stowage_ledger::{Entity, LedgerPool, QueryFilter};
use stowage_types::{EntityKey, FileId, Result, StowageError};

use crate::chunker::{self, ChunkPiece, FileMetadata};
use crate::keycache::{EntityKeyCache, EntityKeyIndex};

/// A reassembled, integrity-verified payload.
#[derive(Debug)]
pub struct RetrievedFile {
    pub metadata: FileMetadata,
    pub bytes: Vec<u8>,
}

/// Metadata + chunk fetch, reassembly, and checksum verification.
///
/// The entity-key cache provides the fast path; every miss degrades to an
/// attribute scan, never to an error.
pub struct RetrievePipeline {
    keycache: Arc<EntityKeyCache>,
    pool: Arc<LedgerPool>,
}

impl RetrievePipeline {
    pub fn new(keycache: Arc<EntityKeyCache>, pool: Arc<LedgerPool>) -> Self {
        Self { keycache, pool }
    }

    /// Fetch, reassemble, and verify one file.
    pub async fn get_file(&self, file_id: FileId) -> Result<RetrievedFile> {
        let index = self.keycache.get(file_id).await;

        let metadata = self.fetch_metadata(file_id, index.as_ref()).await?;

        let chunk_entities = match &index {
            Some(idx) if idx.chunk_keys.len() as u32 == metadata.chunk_count => {
                match self.fetch_chunks_by_key(&idx.chunk_keys).await {
                    Ok(entities) => entities,
                    Err(e) => {
                        debug!(%file_id, "keyed chunk fetch failed, falling back to scan: {e}");
                        self.scan_chunks(file_id).await?
                    }
                }
            }
            _ => self.scan_chunks(file_id).await?,
        };

        let mut pieces = Vec::with_capacity(chunk_entities.len());
        for entity in &chunk_entities {
            pieces.push(piece_from_entity(entity)?);
        }

        let bytes = chunker::reassemble(&metadata, pieces)?;
        Ok(RetrievedFile { metadata, bytes })
    }

    /// Metadata for one file, via the cached key when possible.
    pub async fn fetch_metadata(
        &self,
        file_id: FileId,
        index: Option<&EntityKeyIndex>,
    ) -> Result<FileMetadata> {
        if let Some(key) = index.and_then(|i| i.metadata_key.clone()) {
            let fetched = self
                .pool
                .with_read("metadata_by_key", |client| {
                    let key = key.clone();
                    async move { client.get_entity(&key).await }
                })
                .await;
            match fetched {
                Ok(Some(entity)) => return metadata_from_entity(&entity),
                Ok(None) => {
                    debug!(%file_id, "cached metadata key is stale, falling back to scan");
                }
                Err(e) => {
                    debug!(%file_id, "keyed metadata fetch failed, falling back to scan: {e}");
                }
            }
        }

        let filter = QueryFilter::for_type(annotation::TYPE_METADATA)
            .and_string(annotation::FILE_ID, file_id.to_string())
            .with_limit(1);
        let page = self
            .pool
            .with_read("metadata_scan", |client| {
                let filter = filter.clone();
                async move { client.query(&filter, None).await }
            })
            .await?;

        match page.entities.first() {
            Some(entity) => metadata_from_entity(entity),
            None => Err(StowageError::NotFound(file_id.to_string())),
        }
    }

    /// The file's entity keys: cache hit, or reconstructed from the ledger's
    /// attribute index. Fails with `NOT_FOUND` for unknown files.
    pub async fn fetch_entity_index(&self, file_id: FileId) -> Result<EntityKeyIndex> {
        if let Some(index) = self.keycache.get(file_id).await {
            return Ok(index);
        }

        let metadata = self.fetch_metadata(file_id, None).await?;
        let chunks = self.scan_chunks(file_id).await?;
        Ok(EntityKeyIndex {
            metadata_key: metadata.ledger_key,
            chunk_keys: chunks.into_iter().map(|e| e.key).collect(),
        })
    }

    async fn fetch_chunks_by_key(&self, keys: &[EntityKey]) -> Result<Vec<Entity>> {
        let fetches = keys.iter().map(|key| {
            let key = key.clone();
            self.pool.with_read("chunk_by_key", move |client| {
                let key = key.clone();
                async move {
                    client.get_entity(&key).await?.ok_or_else(|| {
                        StowageError::NotFound(format!("chunk entity {key} has expired"))
                    })
                }
            })
        });
        try_join_all(fetches).await
    }

    /// Attribute scan over all chunk entities of a file, pages drained,
    /// ascending `chunk_index`.
    async fn scan_chunks(&self, file_id: FileId) -> Result<Vec<Entity>> {
        let filter = QueryFilter::for_type(annotation::TYPE_CHUNK)
            .and_string(annotation::FILE_ID, file_id.to_string());

        let mut entities = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .pool
                .with_read("chunk_scan", |client| {
                    let filter = filter.clone();
                    let cursor = cursor.clone();
                    async move { client.query(&filter, cursor.as_deref()).await }
                })
                .await?;
            entities.extend(page.entities);
            match page.cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }

        entities.sort_by_key(|e| chunk_index_of(e).unwrap_or(u32::MAX));
        Ok(entities)
    }
}

fn chunk_index_of(entity: &Entity) -> Option<u32> {
    entity
        .string_annotation(annotation::CHUNK_INDEX)
        .and_then(|s| s.parse().ok())
}

fn piece_from_entity(entity: &Entity) -> Result<ChunkPiece> {
    let chunk_index = chunk_index_of(entity).ok_or_else(|| {
        StowageError::IntegrityFailed(format!(
            "chunk entity {} has no usable chunk_index annotation",
            entity.key
        ))
    })?;
    let original_size = entity
        .numeric_annotation(annotation::CHUNK_SIZE)
        .unwrap_or(entity.payload.len() as u64);
    Ok(chunker::piece_from_compressed(
        chunk_index,
        entity.payload.clone(),
        original_size,
    ))
}

/// Rebuild a `FileMetadata` from a metadata entity: JSON payload for the
/// descriptive fields, annotations for the block-expiry, entity key for the
/// ledger key.
pub fn metadata_from_entity(entity: &Entity) -> Result<FileMetadata> {
    #[derive(serde::Deserialize)]
    struct MetadataPayload {
        file_id: FileId,
        original_filename: String,
        content_type: String,
        file_extension: String,
        total_size: u64,
        chunk_count: u32,
        checksum: String,
        created_at: chrono::DateTime<chrono::Utc>,
        btl_days: u32,
        #[serde(default)]
        owner: Option<String>,
    }

    let payload: MetadataPayload = serde_json::from_slice(&entity.payload)?;
    Ok(FileMetadata {
        file_id: payload.file_id,
        original_filename: payload.original_filename,
        content_type: payload.content_type,
        file_extension: payload.file_extension,
        total_size: payload.total_size,
        chunk_count: payload.chunk_count,
        checksum: payload.checksum,
        created_at: payload.created_at,
        expiration_block: entity
            .numeric_annotation(annotation::EXPIRATION_BLOCK)
            .unwrap_or(entity.expiration_block),
        btl_days: payload.btl_days,
        ledger_key: Some(entity.key.clone()),
        owner: payload.owner,
    })
}
