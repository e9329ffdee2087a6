//! Provider registry — process-wide map from provider name to implementation.
//!
//! Populated once at startup and shared as `Arc<ProviderRegistry>` after
//! that; `register` takes `&mut self`, so steady-state mutation is a compile
//! error rather than a runtime hazard.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::DeploymentProvider;

/// Maps provider names to their implementations.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<&'static str, Arc<dyn DeploymentProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its own name.
    ///
    /// Overwriting an existing registration warns but succeeds; the last
    /// registration wins.
    pub fn register(&mut self, provider: Arc<dyn DeploymentProvider>) {
        let name = provider.name();
        if self.providers.insert(name, provider).is_some() {
            warn!(provider = name, "provider re-registered, previous entry replaced");
        } else {
            debug!(provider = name, "provider registered");
        }
    }

    /// Look up a provider by name.
    pub fn get(&self, name: &str) -> ProviderResult<Arc<dyn DeploymentProvider>> {
        self.providers.get(name).cloned().ok_or_else(|| {
            ProviderError::NotRegistered {
                name: name.to_string(),
                available: self.names().join(", "),
            }
        })
    }

    /// All registered provider names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        self.providers.keys().copied().collect()
    }

    /// Providers whose credentials/configuration are present.
    pub fn available(&self) -> Vec<Arc<dyn DeploymentProvider>> {
        self.providers
            .values()
            .filter(|p| p.is_available())
            .cloned()
            .collect()
    }

    /// All registered providers.
    pub fn all(&self) -> Vec<Arc<dyn DeploymentProvider>> {
        self.providers.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::*;
    use crate::status::StatusReport;
    use async_trait::async_trait;

    struct FakeProvider {
        name: &'static str,
        available: bool,
    }

    #[async_trait]
    impl DeploymentProvider for FakeProvider {
        fn name(&self) -> &'static str {
            self.name
        }

        fn is_available(&self) -> bool {
            self.available
        }

        async fn deploy(
            &self,
            _service_id: &str,
            _options: DeployOptions,
        ) -> ProviderResult<DeploymentResult> {
            unimplemented!()
        }

        async fn stop(&self, _deployment_id: &str) -> ProviderResult<()> {
            unimplemented!()
        }

        async fn start(&self, _deployment_id: &str) -> ProviderResult<()> {
            unimplemented!()
        }

        async fn close(&self, _deployment_id: &str) -> ProviderResult<()> {
            unimplemented!()
        }

        async fn status(&self, _deployment_id: &str) -> ProviderResult<StatusReport> {
            unimplemented!()
        }

        async fn logs(&self, _deployment_id: &str, _options: LogOptions) -> ProviderResult<String> {
            unimplemented!()
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                supports_stop: false,
                supports_start: false,
                supports_tee: false,
                billing: BillingModel::PerBlockEscrow,
                config_format: ConfigFormat::Sdl,
            }
        }
    }

    #[test]
    fn register_and_get() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider {
            name: "market",
            available: true,
        }));

        assert!(registry.get("market").is_ok());
        assert_eq!(registry.names(), vec!["market"]);
    }

    #[test]
    fn get_unknown_lists_available_names() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider {
            name: "market",
            available: true,
        }));
        registry.register(Arc::new(FakeProvider {
            name: "tee",
            available: true,
        }));

        let err = registry.get("ghost").err().unwrap();
        match err {
            ProviderError::NotRegistered { name, available } => {
                assert_eq!(name, "ghost");
                assert_eq!(available, "market, tee");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn overwrite_keeps_last_registration() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider {
            name: "market",
            available: false,
        }));
        registry.register(Arc::new(FakeProvider {
            name: "market",
            available: true,
        }));

        assert_eq!(registry.names().len(), 1);
        assert!(registry.get("market").unwrap().is_available());
    }

    #[test]
    fn available_filters_unconfigured() {
        let mut registry = ProviderRegistry::new();
        registry.register(Arc::new(FakeProvider {
            name: "market",
            available: true,
        }));
        registry.register(Arc::new(FakeProvider {
            name: "tee",
            available: false,
        }));

        let available = registry.available();
        assert_eq!(available.len(), 1);
        assert_eq!(available[0].name(), "market");
    }
}
