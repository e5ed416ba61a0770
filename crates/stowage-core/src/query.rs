use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use stowage_ledger::entity::annotation;
use stowage_ledger::{LedgerPool, QueryFilter};
use stowage_types::{FileId, Result};

use crate::retrieve::metadata_from_entity;

/// One row of a listing response.
#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub file_id: FileId,
    pub original_filename: String,
    pub content_type: String,
    pub file_extension: String,
    pub total_size: u64,
    pub chunk_count: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

/// Read-only listings over `type=metadata` entities via the ledger's
/// attribute index. All pages are drained before returning.
///
/// In ledger mode, extension and content-type listings may legitimately be
/// empty while the attribute index catches up; the in-memory backend indexes
/// synchronously.
pub struct QueryService {
    pool: Arc<LedgerPool>,
}

impl QueryService {
    pub fn new(pool: Arc<LedgerPool>) -> Self {
        Self { pool }
    }

    async fn list(&self, filter: QueryFilter) -> Result<Vec<FileSummary>> {
        let mut summaries = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .pool
                .with_read("metadata_list", |client| {
                    let filter = filter.clone();
                    let cursor = cursor.clone();
                    async move { client.query(&filter, cursor.as_deref()).await }
                })
                .await?;

            for entity in &page.entities {
                // Skip undecodable strays rather than failing the listing.
                if let Ok(metadata) = metadata_from_entity(entity) {
                    summaries.push(FileSummary {
                        file_id: metadata.file_id,
                        original_filename: metadata.original_filename,
                        content_type: metadata.content_type,
                        file_extension: metadata.file_extension,
                        total_size: metadata.total_size,
                        chunk_count: metadata.chunk_count,
                        created_at: metadata.created_at,
                        owner: metadata.owner,
                    });
                }
            }

            match page.cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(summaries)
    }

    /// Files owned by `owner`, newest first.
    pub async fn by_owner(&self, owner: &str) -> Result<Vec<FileSummary>> {
        let filter =
            QueryFilter::for_type(annotation::TYPE_METADATA).and_string(annotation::OWNER, owner);
        let mut summaries = self.list(filter).await?;
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(summaries)
    }

    /// Files with the given extension (matched lowercased).
    pub async fn by_extension(&self, extension: &str) -> Result<Vec<FileSummary>> {
        let filter = QueryFilter::for_type(annotation::TYPE_METADATA).and_string(
            annotation::FILE_EXTENSION,
            extension.to_ascii_lowercase(),
        );
        self.list(filter).await
    }

    pub async fn by_content_type(&self, content_type: &str) -> Result<Vec<FileSummary>> {
        let filter = QueryFilter::for_type(annotation::TYPE_METADATA)
            .and_string(annotation::CONTENT_TYPE, content_type);
        self.list(filter).await
    }
}
