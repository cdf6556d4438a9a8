//! Provider selection.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::ProviderResult;
use crate::http::{HttpProviderConfig, HttpRenderProvider};
use crate::mock::MockRenderProvider;
use crate::render::RenderProvider;

/// Provider configuration.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Default provider name (`RENDER_PROVIDER`)
    pub render_provider: String,
    /// Delay between mock checkpoints
    pub mock_step_delay: Duration,
    /// Configured external back-ends
    pub http: Vec<HttpProviderConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            render_provider: "mock".to_string(),
            mock_step_delay: Duration::from_secs(1),
            http: Vec::new(),
        }
    }
}

impl ProviderConfig {
    /// Create config from environment variables.
    ///
    /// An external back-end is configured only when its `<NAME>_API_KEY`
    /// is set; `<NAME>_BASE_URL` overrides the public endpoint.
    pub fn from_env() -> Self {
        let mut http = Vec::new();

        if let Ok(key) = std::env::var("SHOTSTACK_API_KEY") {
            let base = std::env::var("SHOTSTACK_BASE_URL")
                .unwrap_or_else(|_| "https://api.shotstack.io/v1".to_string());
            http.push(HttpProviderConfig::shotstack(base, key));
        }
        if let Ok(key) = std::env::var("CREATOMATE_API_KEY") {
            let base = std::env::var("CREATOMATE_BASE_URL")
                .unwrap_or_else(|_| "https://api.creatomate.com/v1".to_string());
            http.push(HttpProviderConfig::creatomate(base, key));
        }

        Self {
            render_provider: std::env::var("RENDER_PROVIDER").unwrap_or_else(|_| "mock".to_string()),
            mock_step_delay: std::env::var("MOCK_RENDER_STEP_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(1)),
            http,
        }
    }
}

/// Name-keyed provider factory. Never fails a lookup: unknown names
/// resolve to the mock provider.
pub struct ProviderRegistry {
    default_name: String,
    mock: Arc<dyn RenderProvider>,
    providers: HashMap<String, Arc<dyn RenderProvider>>,
}

impl ProviderRegistry {
    pub fn new(default_name: impl Into<String>, mock: Arc<dyn RenderProvider>) -> Self {
        Self {
            default_name: default_name.into().to_ascii_lowercase(),
            mock,
            providers: HashMap::new(),
        }
    }

    pub fn from_config(config: &ProviderConfig) -> ProviderResult<Self> {
        let mut registry = Self::new(
            config.render_provider.clone(),
            Arc::new(MockRenderProvider::new(config.mock_step_delay)),
        );
        for http in &config.http {
            let name = http.name.clone();
            registry.register(name.clone(), Arc::new(HttpRenderProvider::new(http.clone())?));
            info!(provider = %name, "Registered render provider");
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn RenderProvider>) {
        self.providers
            .insert(name.into().to_ascii_lowercase(), provider);
    }

    pub fn default_name(&self) -> &str {
        &self.default_name
    }

    /// Case-insensitive lookup with mock fallback.
    pub fn resolve(&self, name: &str) -> Arc<dyn RenderProvider> {
        let key = name.trim().to_ascii_lowercase();
        if key == "mock" {
            return self.mock.clone();
        }
        match self.providers.get(&key) {
            Some(provider) => provider.clone(),
            None => {
                warn!(
                    provider = %name,
                    "Unknown or unconfigured render provider, falling back to mock"
                );
                self.mock.clone()
            }
        }
    }

    /// Provider named by an explicit override, else the configured default.
    pub fn resolve_or_default(&self, name: Option<&str>) -> Arc<dyn RenderProvider> {
        self.resolve(name.unwrap_or(&self.default_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProviderRegistry {
        let config = ProviderConfig {
            render_provider: "Shotstack".into(),
            mock_step_delay: Duration::from_millis(1),
            http: vec![HttpProviderConfig::shotstack("https://api.example.com/v1", "k")],
        };
        ProviderRegistry::from_config(&config).unwrap()
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.resolve("SHOTSTACK").name(), "shotstack");
        assert_eq!(registry.resolve_or_default(None).name(), "shotstack");
    }

    #[test]
    fn test_unknown_falls_back_to_mock() {
        let registry = registry();
        assert_eq!(registry.resolve("runway").name(), "mock");
        // Known name but not configured
        assert_eq!(registry.resolve("creatomate").name(), "mock");
        assert_eq!(registry.resolve("").name(), "mock");
    }
}
