use serde::{Deserialize, Serialize};

use stowage_types::EntityKey;

/// Annotation names shared by the write pipeline and the query service.
///
/// Every entity the middleware creates is tagged with `TYPE` so attribute
/// queries can be scoped to one entity kind.
pub mod annotation {
    pub const TYPE: &str = "type";
    pub const FILE_ID: &str = "file_id";
    pub const CHUNK_INDEX: &str = "chunk_index";
    pub const CHECKSUM: &str = "checksum";
    pub const CREATED_AT: &str = "created_at";
    pub const ORIGINAL_FILENAME: &str = "original_filename";
    pub const CONTENT_TYPE: &str = "content_type";
    pub const FILE_EXTENSION: &str = "file_extension";
    pub const OWNER: &str = "owner";
    pub const USER_ADDRESS: &str = "user_address";
    pub const DATE: &str = "date";

    pub const TOTAL_SIZE: &str = "total_size";
    pub const CHUNK_COUNT: &str = "chunk_count";
    pub const CHUNK_SIZE: &str = "chunk_size";
    pub const EXPIRATION_BLOCK: &str = "expiration_block";
    pub const BTL_DAYS: &str = "btl_days";
    pub const USED_BYTES: &str = "used_bytes";
    pub const UPLOADS_TODAY: &str = "uploads_today";

    pub const TYPE_METADATA: &str = "metadata";
    pub const TYPE_CHUNK: &str = "chunk";
    pub const TYPE_QUOTA: &str = "quota";
}

/// An entity to be created on the ledger: opaque payload plus the string and
/// numeric annotations the ledger indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDraft {
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub string_annotations: Vec<(String, String)>,
    pub numeric_annotations: Vec<(String, u64)>,
    pub expiration_block: u64,
}

impl EntityDraft {
    pub fn new(payload: Vec<u8>, expiration_block: u64) -> Self {
        Self {
            payload,
            string_annotations: Vec::new(),
            numeric_annotations: Vec::new(),
            expiration_block,
        }
    }

    pub fn with_string(mut self, name: &str, value: impl Into<String>) -> Self {
        self.string_annotations.push((name.to_string(), value.into()));
        self
    }

    pub fn with_numeric(mut self, name: &str, value: u64) -> Self {
        self.numeric_annotations.push((name.to_string(), value));
        self
    }

    /// Value of a string annotation, if present.
    pub fn string_annotation(&self, name: &str) -> Option<&str> {
        self.string_annotations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }
}

/// An entity read back from the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    #[serde(with = "payload_base64")]
    pub payload: Vec<u8>,
    pub string_annotations: Vec<(String, String)>,
    pub numeric_annotations: Vec<(String, u64)>,
    pub expiration_block: u64,
}

impl Entity {
    pub fn string_annotation(&self, name: &str) -> Option<&str> {
        self.string_annotations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn numeric_annotation(&self, name: &str) -> Option<u64> {
        self.numeric_annotations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| *v)
    }
}

/// Equality filter over the ledger's attribute index.
///
/// All clauses must match. String clauses dominate in practice; numeric
/// clauses exist for `chunk_index`-ordered scans.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryFilter {
    pub string_equals: Vec<(String, String)>,
    pub numeric_equals: Vec<(String, u64)>,
    /// Cap on results per page; the ledger may return fewer.
    pub limit: Option<usize>,
}

impl QueryFilter {
    pub fn for_type(entity_type: &str) -> Self {
        Self::default().and_string(annotation::TYPE, entity_type)
    }

    pub fn and_string(mut self, name: &str, value: impl Into<String>) -> Self {
        self.string_equals.push((name.to_string(), value.into()));
        self
    }

    pub fn and_numeric(mut self, name: &str, value: u64) -> Self {
        self.numeric_equals.push((name.to_string(), value));
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, entity: &Entity) -> bool {
        self.string_equals
            .iter()
            .all(|(n, v)| entity.string_annotation(n) == Some(v.as_str()))
            && self
                .numeric_equals
                .iter()
                .all(|(n, v)| entity.numeric_annotation(n) == Some(*v))
    }
}

/// One page of query results. `cursor` is opaque; `None` means the scan is
/// complete.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryPage {
    pub entities: Vec<Entity>,
    pub cursor: Option<String>,
}

impl QueryPage {
    pub fn empty() -> Self {
        Self {
            entities: Vec::new(),
            cursor: None,
        }
    }
}

/// Payloads travel as base64 inside JSON bodies.
mod payload_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn encode(data: &[u8]) -> String {
        STANDARD.encode(data)
    }

    pub fn decode(s: &str) -> Option<Vec<u8>> {
        STANDARD.decode(s).ok()
    }

    pub fn serialize<S: Serializer>(data: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        decode(&s).ok_or_else(|| serde::de::Error::custom("invalid base64 payload"))
    }
}

pub use payload_base64::{decode as payload_decode, encode as payload_encode};
