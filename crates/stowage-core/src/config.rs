use std::time::Duration;

use serde::{Deserialize, Serialize};

use stowage_types::{Result, StowageError};

/// Which backend holds entities: an in-process map or the real ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    #[default]
    Memory,
    Ledger,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StowageConfig {
    #[serde(default)]
    pub limits: LimitsSection,
    #[serde(default)]
    pub ledger: LedgerSection,
    #[serde(default)]
    pub pools: PoolsSection,
    #[serde(default)]
    pub quota: QuotaSection,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsSection {
    /// Reject larger payloads at admission. Accepts "50M"-style strings.
    #[serde(default = "default_max_file_size", deserialize_with = "deserialize_size")]
    pub max_file_size: u64,

    /// Uncompressed slice size per chunk.
    #[serde(default = "default_chunk_size", deserialize_with = "deserialize_size")]
    pub chunk_size: u64,

    /// Closed allowlist of MIME prefixes admitted at the API boundary.
    #[serde(default = "default_allowed_content_types")]
    pub allowed_content_types: Vec<String>,

    /// Admission-path deadline.
    #[serde(default = "default_request_deadline_secs")]
    pub request_deadline_secs: u64,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            chunk_size: default_chunk_size(),
            allowed_content_types: default_allowed_content_types(),
            request_deadline_secs: default_request_deadline_secs(),
        }
    }
}

impl LimitsSection {
    /// Prefix match against the allowlist ("text/" admits "text/plain").
    pub fn content_type_allowed(&self, content_type: &str) -> bool {
        self.allowed_content_types
            .iter()
            .any(|prefix| content_type.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSection {
    #[serde(default)]
    pub storage_mode: StorageMode,

    /// Gateway URL; required when `storage_mode = ledger`.
    #[serde(default)]
    pub endpoint: String,

    /// Write credential. Absent means read-only handles.
    #[serde(default)]
    pub private_key: Option<String>,

    /// Per-ledger-call deadline in milliseconds.
    #[serde(default = "default_ledger_timeout_ms")]
    pub timeout_ms: u64,

    /// Chunks per ledger batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Fallback conversion when the timing probe is unavailable.
    #[serde(default = "default_blocks_per_day")]
    pub blocks_per_day: u64,

    /// Expiration window when the request carries no BTL header.
    #[serde(default = "default_btl_days")]
    pub default_btl_days: u32,
}

impl Default for LedgerSection {
    fn default() -> Self {
        Self {
            storage_mode: StorageMode::default(),
            endpoint: String::new(),
            private_key: None,
            timeout_ms: default_ledger_timeout_ms(),
            batch_size: default_batch_size(),
            blocks_per_day: default_blocks_per_day(),
            default_btl_days: default_btl_days(),
        }
    }
}

impl LedgerSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolsSection {
    #[serde(default = "default_write_pool_max")]
    pub write_pool_max: usize,
    #[serde(default = "default_read_pool_max")]
    pub read_pool_max: usize,
    #[serde(default = "default_pool_idle_ms")]
    pub pool_idle_ms: u64,
    #[serde(default = "default_pool_health_ms")]
    pub pool_health_ms: u64,
    #[serde(default = "default_pool_connect_timeout_ms")]
    pub pool_connect_timeout_ms: u64,
}

impl Default for PoolsSection {
    fn default() -> Self {
        Self {
            write_pool_max: default_write_pool_max(),
            read_pool_max: default_read_pool_max(),
            pool_idle_ms: default_pool_idle_ms(),
            pool_health_ms: default_pool_health_ms(),
            pool_connect_timeout_ms: default_pool_connect_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaSection {
    #[serde(
        default = "default_free_tier_max_bytes",
        deserialize_with = "deserialize_size"
    )]
    pub free_tier_max_bytes: u64,
    #[serde(default = "default_free_tier_max_uploads")]
    pub free_tier_max_uploads_per_day: u32,
    /// Presenting this opaque key skips quota checks.
    #[serde(default)]
    pub unlimited_bypass_key: Option<String>,
    /// Read-through cache TTL over the authoritative store.
    #[serde(default = "default_quota_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for QuotaSection {
    fn default() -> Self {
        Self {
            free_tier_max_bytes: default_free_tier_max_bytes(),
            free_tier_max_uploads_per_day: default_free_tier_max_uploads(),
            unlimited_bypass_key: None,
            cache_ttl_secs: default_quota_cache_ttl_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSection {
    /// Remote session cache URL. Absent means memory-only sessions.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer token for the remote cache.
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    #[serde(default = "default_entity_keys_ttl_secs")]
    pub entity_keys_ttl_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            token: None,
            session_ttl_secs: default_session_ttl_secs(),
            entity_keys_ttl_secs: default_entity_keys_ttl_secs(),
        }
    }
}

fn default_max_file_size() -> u64 {
    50 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    32 * 1024
}

fn default_allowed_content_types() -> Vec<String> {
    [
        "text/",
        "image/",
        "audio/",
        "video/",
        "application/json",
        "application/pdf",
        "application/zip",
        "application/octet-stream",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_request_deadline_secs() -> u64 {
    300
}

fn default_ledger_timeout_ms() -> u64 {
    30_000
}

fn default_batch_size() -> usize {
    16
}

fn default_blocks_per_day() -> u64 {
    2880
}

fn default_btl_days() -> u32 {
    30
}

fn default_write_pool_max() -> usize {
    4
}

fn default_read_pool_max() -> usize {
    8
}

fn default_pool_idle_ms() -> u64 {
    300_000
}

fn default_pool_health_ms() -> u64 {
    30_000
}

fn default_pool_connect_timeout_ms() -> u64 {
    5_000
}

fn default_free_tier_max_bytes() -> u64 {
    500 * 1024 * 1024
}

fn default_free_tier_max_uploads() -> u32 {
    100
}

fn default_quota_cache_ttl_secs() -> u64 {
    600
}

fn default_session_ttl_secs() -> u64 {
    7200
}

fn default_entity_keys_ttl_secs() -> u64 {
    7 * 24 * 3600
}

/// Parse a size string: plain bytes, or a `K`/`M`/`G` suffix (powers of 1024).
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(StowageError::Config("empty size value".into()));
    }
    let (number, multiplier) = match s.chars().last() {
        Some('K' | 'k') => (&s[..s.len() - 1], 1024u64),
        Some('M' | 'm') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G' | 'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| StowageError::Config(format!("invalid size value: '{s}'")))?;
    value
        .checked_mul(multiplier)
        .ok_or_else(|| StowageError::Config(format!("size value overflows: '{s}'")))
}

fn deserialize_size<'de, D>(de: D) -> std::result::Result<u64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum SizeRepr {
        Number(u64),
        Text(String),
    }
    match SizeRepr::deserialize(de)? {
        SizeRepr::Number(n) => Ok(n),
        SizeRepr::Text(s) => parse_size(&s).map_err(serde::de::Error::custom),
    }
}
