use async_trait::async_trait;

use stowage_types::{EntityKey, Result};

use crate::entity::{Entity, EntityDraft, QueryFilter, QueryPage};

/// A handle onto the ledger's create/read/query capabilities.
///
/// Implementations: [`crate::MemoryLedger`] for single-process mode and
/// tests, [`crate::rpc::HttpLedger`] for the real thing. Handles are cheap
/// to clone behind `Arc` and are pooled by [`crate::LedgerPool`].
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Create a batch of entities in one ledger transaction.
    ///
    /// Returns one key per draft, in draft order. The call is atomic: either
    /// every entity in the batch exists afterwards or none does.
    async fn create_entities(&self, drafts: &[EntityDraft]) -> Result<Vec<EntityKey>>;

    /// Read a single entity by its key. `None` if absent or expired.
    async fn get_entity(&self, key: &EntityKey) -> Result<Option<Entity>>;

    /// One page of an attribute-index query. Pass the previous page's
    /// `cursor` to continue; `cursor: None` in the result ends the scan.
    async fn query(&self, filter: &QueryFilter, cursor: Option<&str>) -> Result<QueryPage>;

    /// Height of the chain head.
    async fn current_block(&self) -> Result<u64>;

    /// Seconds per block, from the ledger's timing probe.
    async fn block_seconds(&self) -> Result<f64>;

    /// Cheap liveness check used by pool health and `/health`.
    async fn ping(&self) -> Result<()>;

    /// Whether this handle holds credentials that allow entity creation.
    /// Only credentialed handles may occupy the write pool.
    fn has_write_credentials(&self) -> bool;
}
