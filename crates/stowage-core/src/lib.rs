pub mod chunker;
pub mod config;
pub mod ingest;
pub mod keycache;
pub mod kv;
pub mod query;
pub mod quota;
pub mod retrieve;
pub mod service;
pub mod session;

pub use config::{StorageMode, StowageConfig};
pub use service::Stowage;
