use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use stowage_types::{EntityKey, FileId, Result};

use crate::kv::KvStore;

/// Namespace for entity-key index entries, disjoint from session keys.
const KEY_PREFIX: &str = "entitykeys:";

/// Deadline on cache reads; a slow cache must not stall retrieval, which can
/// always fall back to a ledger attribute query.
const GET_DEADLINE: Duration = Duration::from_secs(5);

/// Ledger keys for one file: the metadata entity plus chunk entities in
/// `chunk_index` order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityKeyIndex {
    pub metadata_key: Option<EntityKey>,
    pub chunk_keys: Vec<EntityKey>,
}

impl EntityKeyIndex {
    pub fn total_entities(&self) -> usize {
        self.chunk_keys.len() + usize::from(self.metadata_key.is_some())
    }
}

/// Write-through observation of successful ledger writes, never the source
/// of truth. A miss, a decode failure, or a deadline all mean "scan the
/// ledger instead".
pub struct EntityKeyCache {
    store: Arc<dyn KvStore>,
    ttl: Duration,
}

impl EntityKeyCache {
    pub fn new(store: Arc<dyn KvStore>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    fn cache_key(file_id: FileId) -> String {
        format!("{KEY_PREFIX}{file_id}")
    }

    /// Record the keys the writer observed. Best-effort: a failed write only
    /// costs the fast path.
    pub async fn put(&self, file_id: FileId, index: &EntityKeyIndex) -> Result<()> {
        let body = serde_json::to_string(index)?;
        self.store
            .put(&Self::cache_key(file_id), &body, self.ttl)
            .await
    }

    /// Fetch the index under the read deadline. `None` covers miss, timeout,
    /// decode failure, and store errors alike.
    pub async fn get(&self, file_id: FileId) -> Option<EntityKeyIndex> {
        let fetched =
            tokio::time::timeout(GET_DEADLINE, self.store.get(&Self::cache_key(file_id))).await;
        match fetched {
            Ok(Ok(Some(body))) => match serde_json::from_str(&body) {
                Ok(index) => Some(index),
                Err(e) => {
                    debug!(%file_id, "entity-key cache entry undecodable, treating as miss: {e}");
                    None
                }
            },
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!(%file_id, "entity-key cache read failed, treating as miss: {e}");
                None
            }
            Err(_) => {
                debug!(%file_id, "entity-key cache read deadline hit, treating as miss");
                None
            }
        }
    }

    pub async fn delete(&self, file_id: FileId) -> Result<()> {
        self.store.delete(&Self::cache_key(file_id)).await
    }
}
