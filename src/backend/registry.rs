//! Registry of backend adapters, keyed by identity id.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;

use super::{Backend, BackendInfo};
use crate::config::Config;

/// The fixed default backend. Not user-configurable at this layer; callers
/// with a preference policy select explicitly via [`BackendRegistry::get`].
pub const DEFAULT_BACKEND: &str = "claude";

#[derive(Debug, Error)]
pub enum RegistryError {
    /// The id was never registered. Distinct from a registered backend whose
    /// binary is not installed — that is reported by `detect()`.
    #[error("Unknown backend: {0}")]
    UnknownBackend(String),
}

pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Registry with all built-in adapters registered.
    pub fn with_defaults(config: &Config) -> Self {
        let mut registry = Self::new();
        registry.register(super::claude::registry_entry(config.claude.clone()));
        registry.register(super::gemini::registry_entry(config.gemini.clone()));
        registry.register(super::codex::registry_entry(config.codex.clone()));
        registry
    }

    /// Insert or overwrite by identity id.
    pub fn register(&mut self, backend: Arc<dyn Backend>) {
        self.backends.insert(backend.id().to_string(), backend);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(id).cloned()
    }

    /// Lookup that treats absence as the caller error it is.
    pub fn require(&self, id: &str) -> Result<Arc<dyn Backend>, RegistryError> {
        self.get(id)
            .ok_or_else(|| RegistryError::UnknownBackend(id.to_string()))
    }

    /// All adapters, sorted by display name for stable enumeration.
    pub fn get_all(&self) -> Vec<Arc<dyn Backend>> {
        let mut list: Vec<_> = self.backends.values().cloned().collect();
        list.sort_by(|a, b| a.name().cmp(b.name()));
        list
    }

    /// Run `detect()` concurrently across every adapter. Each adapter
    /// reports its own `BackendInfo` regardless of the others' failures.
    pub async fn detect_installed(&self) -> Vec<BackendInfo> {
        let backends = self.get_all();
        join_all(backends.iter().map(|backend| backend.detect())).await
    }

    pub fn default_id(&self) -> &str {
        DEFAULT_BACKEND
    }

    pub fn get_default(&self) -> Option<Arc<dyn Backend>> {
        self.get(DEFAULT_BACKEND)
            .or_else(|| self.backends.values().next().cloned())
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
