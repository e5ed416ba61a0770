use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering::Relaxed};
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;

use stowage_types::{EntityKey, Result, StowageError};

use crate::client::LedgerClient;
use crate::entity::{Entity, EntityDraft, QueryFilter, QueryPage};

/// Results per page served by the in-memory query index.
const PAGE_SIZE: usize = 64;

/// In-process ledger used for `storage_mode=memory` and tests.
///
/// Blocks advance with wall-clock time from a fixed genesis instant, so
/// expiration behaves like the real ledger without a background ticker.
/// Expired entities are dropped lazily on read.
pub struct MemoryLedger {
    inner: Mutex<HashMap<EntityKey, Entity>>,
    genesis: Instant,
    block_seconds: f64,
    next_key: AtomicU64,
    /// Fail the next N batch creates with a transient error (tests only).
    fail_creates: AtomicU32,
    create_calls: AtomicU64,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::with_block_seconds(30.0)
    }

    pub fn with_block_seconds(block_seconds: f64) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            genesis: Instant::now(),
            block_seconds,
            next_key: AtomicU64::new(1),
            fail_creates: AtomicU32::new(0),
            create_calls: AtomicU64::new(0),
        }
    }

    fn block_now(&self) -> u64 {
        (self.genesis.elapsed().as_secs_f64() / self.block_seconds) as u64
    }

    fn mint_key(&self) -> EntityKey {
        let n = self.next_key.fetch_add(1, Relaxed);
        EntityKey::new(format!("mem-{n:08x}"))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<EntityKey, Entity>> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Inject transient failures into the next `n` `create_entities` calls.
    pub fn fail_next_creates(&self, n: u32) {
        self.fail_creates.store(n, Relaxed);
    }

    /// Total `create_entities` calls observed, including failed ones.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Relaxed)
    }

    /// Number of live (unexpired) entities.
    pub fn len(&self) -> usize {
        let now = self.block_now();
        self.lock()
            .values()
            .filter(|e| e.expiration_block > now)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LedgerClient for MemoryLedger {
    async fn create_entities(&self, drafts: &[EntityDraft]) -> Result<Vec<EntityKey>> {
        self.create_calls.fetch_add(1, Relaxed);

        if self
            .fail_creates
            .fetch_update(Relaxed, Relaxed, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(StowageError::LedgerUnavailable(
                "injected transient failure".into(),
            ));
        }

        let current = self.block_now();
        for draft in drafts {
            if draft.expiration_block <= current {
                return Err(StowageError::Validation(format!(
                    "expiration_block {} is not past the chain head {current}",
                    draft.expiration_block
                )));
            }
        }

        let mut inner = self.lock();
        let mut keys = Vec::with_capacity(drafts.len());
        for draft in drafts {
            let key = self.mint_key();
            inner.insert(
                key.clone(),
                Entity {
                    key: key.clone(),
                    payload: draft.payload.clone(),
                    string_annotations: draft.string_annotations.clone(),
                    numeric_annotations: draft.numeric_annotations.clone(),
                    expiration_block: draft.expiration_block,
                },
            );
            keys.push(key);
        }
        Ok(keys)
    }

    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>> {
        let now = self.block_now();
        let mut inner = self.lock();
        match inner.get(key) {
            Some(e) if e.expiration_block > now => Ok(Some(e.clone())),
            Some(_) => {
                inner.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn query(&self, filter: &QueryFilter, cursor: Option<&str>) -> Result<QueryPage> {
        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| StowageError::Validation(format!("invalid query cursor: '{c}'")))?,
            None => 0,
        };

        let now = self.block_now();
        let inner = self.lock();
        // Stable order across pages: sort by key.
        let mut hits: Vec<&Entity> = inner
            .values()
            .filter(|e| e.expiration_block > now && filter.matches(e))
            .collect();
        hits.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));

        let page_size = filter.limit.unwrap_or(PAGE_SIZE).min(PAGE_SIZE).max(1);
        let page: Vec<Entity> = hits
            .iter()
            .skip(offset)
            .take(page_size)
            .map(|e| (*e).clone())
            .collect();

        let consumed = offset + page.len();
        let cursor = if filter.limit.is_none() && consumed < hits.len() {
            Some(consumed.to_string())
        } else {
            None
        };
        Ok(QueryPage {
            entities: page,
            cursor,
        })
    }

    async fn current_block(&self) -> Result<u64> {
        Ok(self.block_now())
    }

    async fn block_seconds(&self) -> Result<f64> {
        Ok(self.block_seconds)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    fn has_write_credentials(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::annotation;

    fn draft(file_id: &str, index: u64) -> EntityDraft {
        EntityDraft::new(vec![index as u8; 4], 1_000_000)
            .with_string(annotation::TYPE, annotation::TYPE_CHUNK)
            .with_string(annotation::FILE_ID, file_id)
            .with_numeric(annotation::CHUNK_INDEX, index)
    }

    #[tokio::test]
    async fn create_and_get_round_trip() {
        let ledger = MemoryLedger::new();
        let keys = ledger.create_entities(&[draft("f1", 0)]).await.unwrap();
        assert_eq!(keys.len(), 1);

        let entity = ledger.get_entity(&keys[0]).await.unwrap().unwrap();
        assert_eq!(entity.payload, vec![0u8; 4]);
        assert_eq!(entity.string_annotation(annotation::FILE_ID), Some("f1"));
    }

    #[tokio::test]
    async fn batch_create_returns_keys_in_draft_order() {
        let ledger = MemoryLedger::new();
        let drafts: Vec<EntityDraft> = (0..5).map(|i| draft("f1", i)).collect();
        let keys = ledger.create_entities(&drafts).await.unwrap();
        assert_eq!(keys.len(), 5);

        for (i, key) in keys.iter().enumerate() {
            let entity = ledger.get_entity(key).await.unwrap().unwrap();
            assert_eq!(
                entity.numeric_annotation(annotation::CHUNK_INDEX),
                Some(i as u64)
            );
        }
    }

    #[tokio::test]
    async fn query_filters_and_paginates() {
        let ledger = MemoryLedger::new();
        let drafts: Vec<EntityDraft> = (0..100).map(|i| draft("f1", i)).collect();
        ledger.create_entities(&drafts).await.unwrap();
        ledger.create_entities(&[draft("f2", 0)]).await.unwrap();

        let filter = QueryFilter::for_type(annotation::TYPE_CHUNK).and_string("file_id", "f1");
        let mut seen = 0;
        let mut cursor: Option<String> = None;
        let mut pages = 0;
        loop {
            let page = ledger.query(&filter, cursor.as_deref()).await.unwrap();
            seen += page.entities.len();
            pages += 1;
            match page.cursor {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        assert_eq!(seen, 100);
        assert!(pages > 1, "expected multiple pages, got {pages}");
    }

    #[tokio::test]
    async fn query_with_limit_returns_single_page() {
        let ledger = MemoryLedger::new();
        let drafts: Vec<EntityDraft> = (0..10).map(|i| draft("f1", i)).collect();
        ledger.create_entities(&drafts).await.unwrap();

        let filter = QueryFilter::for_type(annotation::TYPE_CHUNK).with_limit(1);
        let page = ledger.query(&filter, None).await.unwrap();
        assert_eq!(page.entities.len(), 1);
        assert!(page.cursor.is_none());
    }

    #[tokio::test]
    async fn expired_entities_are_invisible() {
        let ledger = MemoryLedger::with_block_seconds(0.005);
        let mut d = draft("f1", 0);
        d.expiration_block = ledger.current_block().await.unwrap() + 5;
        let keys = ledger.create_entities(&[d]).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        assert!(ledger.get_entity(&keys[0]).await.unwrap().is_none());
        assert_eq!(ledger.len(), 0);
    }

    #[tokio::test]
    async fn rejects_expiration_at_or_below_head() {
        let ledger = MemoryLedger::new();
        let mut d = draft("f1", 0);
        d.expiration_block = 0;
        let err = ledger.create_entities(&[d]).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION");
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let ledger = MemoryLedger::new();
        ledger.fail_next_creates(2);

        assert!(ledger.create_entities(&[draft("f1", 0)]).await.is_err());
        assert!(ledger.create_entities(&[draft("f1", 0)]).await.is_err());
        assert!(ledger.create_entities(&[draft("f1", 0)]).await.is_ok());
        assert_eq!(ledger.create_calls(), 3);
    }
}
