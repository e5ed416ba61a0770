use serde::{Deserialize, Serialize};

use stowage_core::StowageConfig;
use stowage_types::{Result, StowageError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Address to listen on.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Shared bearer token expected from the upstream auth layer.
    pub token: String,

    /// Log output format: "json" or "pretty".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// How long shutdown waits for in-flight writers.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            token: String::new(),
            log_format: default_log_format(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

fn default_listen() -> String {
    "127.0.0.1:8686".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_drain_timeout_secs() -> u64 {
    30
}

/// Load the core configuration from a JSON file, or defaults when no path
/// is given.
pub fn load_core_config(path: Option<&str>) -> Result<StowageConfig> {
    match path {
        Some(path) => {
            let body = std::fs::read_to_string(path).map_err(|e| {
                StowageError::Config(format!("cannot read config file '{path}': {e}"))
            })?;
            serde_json::from_str(&body)
                .map_err(|e| StowageError::Config(format!("invalid config file '{path}': {e}")))
        }
        None => Ok(StowageConfig::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_path_yields_defaults() {
        let config = load_core_config(None).unwrap();
        assert_eq!(config.ledger.batch_size, 16);
    }

    #[test]
    fn unreadable_path_is_a_config_error() {
        let err = load_core_config(Some("/nonexistent/stowage.json")).unwrap_err();
        assert_eq!(err.code(), "CONFIG");
    }
}
