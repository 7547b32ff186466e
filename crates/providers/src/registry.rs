use std::collections::HashMap;
use std::sync::Arc;

use tracing::info;
use voxgate_config::ProviderSettings;

use crate::adapter::{ProviderAdapter, ProviderError, ServiceKind};
use crate::deepgram::DeepgramAdapter;
use crate::openai::OpenAiAdapter;
use crate::whisper::WhisperAdapter;

/// Immutable provider lookup, constructed once at startup and injected
/// into the session manager. Adapters are keyed by their own `name()`.
pub struct ProviderRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    pub fn register(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(adapter.name().to_string(), adapter);
        self
    }

    /// Builds the production registry from settings. Adapters whose keys
    /// are missing still register; they fail with `ConfigurationMissing`
    /// at connect time rather than silently disappearing from lookups.
    pub fn from_settings(settings: &ProviderSettings) -> Self {
        let registry = Self::new()
            .register(Arc::new(DeepgramAdapter::new(settings)))
            .register(Arc::new(WhisperAdapter::new(settings)))
            .register(Arc::new(OpenAiAdapter::new(settings)));
        info!(providers = ?registry.names(), "provider registry built");
        registry
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
        self.adapters
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownProvider(name.to_string()))
    }

    /// First streaming-capable adapter of the given kind; used when a
    /// start request names no provider.
    pub fn default_streaming(&self, kind: ServiceKind) -> Option<Arc<dyn ProviderAdapter>> {
        let mut names: Vec<&String> = self.adapters.keys().collect();
        names.sort();
        names
            .into_iter()
            .map(|n| &self.adapters[n])
            .find(|a| a.kind() == kind && a.supports_streaming())
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}
