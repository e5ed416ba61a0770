use std::sync::Arc;

use stowage_core::Stowage;

use crate::config::ServerSection;

/// Shared application state, wrapped in Arc for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub config: ServerSection,
    pub service: Arc<Stowage>,
}

impl AppState {
    pub fn new(config: ServerSection, service: Arc<Stowage>) -> Self {
        Self {
            inner: Arc::new(AppStateInner { config, service }),
        }
    }
}

/// Identity fields the upstream auth layer attaches to each request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub user_id: String,
    pub role: String,
    pub permissions: Vec<String>,
    /// Legacy `X-API-Key` value, forwarded to the quota bypass check.
    pub api_key: Option<String>,
}
