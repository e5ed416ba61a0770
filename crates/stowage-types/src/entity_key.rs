use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier minted by the ledger when an entity is created.
///
/// The middleware never inspects the contents; keys are stored verbatim in
/// the entity-key cache and handed back on retrieval.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(key: impl Into<String>) -> Self {
        EntityKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityKey({})", self.0)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for EntityKey {
    fn from(s: String) -> Self {
        EntityKey(s)
    }
}

impl From<&str> for EntityKey {
    fn from(s: &str) -> Self {
        EntityKey(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_verbatim() {
        let key = EntityKey::new("0xabc123");
        assert_eq!(key.to_string(), "0xabc123");
        assert_eq!(key.as_str(), "0xabc123");
    }

    #[test]
    fn serde_is_transparent() {
        let key = EntityKey::new("k1");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"k1\"");
        let back: EntityKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }
}
