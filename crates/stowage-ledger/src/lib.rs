pub mod client;
pub mod entity;
pub mod memory;
pub mod pool;
pub mod retry;
pub mod rpc;

pub use client::LedgerClient;
pub use entity::{annotation, Entity, EntityDraft, QueryFilter, QueryPage};
pub use memory::MemoryLedger;
pub use pool::{LedgerPool, PoolConfig, PoolKind};
pub use retry::RetryPolicy;
