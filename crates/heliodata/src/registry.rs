//! Provider registry routing datasets to their adapters.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use heliodata_core::{DataError, DatasetId, Result, SeriesProvider};

/// Registry of provider adapters, keyed by provider name.
///
/// The registry is built once at startup and handed to the
/// [`RequestPlanner`](crate::RequestPlanner) behind an `Arc`. A dataset is
/// served by the provider whose name matches [`DatasetId::provider`].
///
/// # Example
///
/// ```rust,ignore
/// use heliodata::{AmdaConfig, ProviderRegistry};
///
/// let registry = ProviderRegistry::new()
///     .with_amda(AmdaConfig::from_env())?;
/// assert!(registry.contains("amda"));
/// ```
#[derive(Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn SeriesProvider>>,
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.providers.keys().collect();
        names.sort();
        f.debug_struct("ProviderRegistry")
            .field("providers", &names)
            .finish()
    }
}

impl ProviderRegistry {
    /// Create a new empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider under its [`name`](heliodata_core::DataProvider::name).
    ///
    /// A provider registered earlier under the same name is replaced.
    pub fn register(&mut self, provider: Arc<dyn SeriesProvider>) {
        let name = provider.name().to_lowercase();
        debug!(provider = %name, "Registering series provider");
        if self.providers.insert(name.clone(), provider).is_some() {
            warn!(provider = %name, "Replaced previously registered provider");
        }
    }

    /// Builder form of [`register`](Self::register).
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn SeriesProvider>) -> Self {
        self.register(provider);
        self
    }

    /// Look up a provider by name.
    ///
    /// # Errors
    /// Returns [`DataError::ProviderNotConfigured`] if nothing is registered
    /// under `name`.
    pub fn get(&self, name: &str) -> Result<Arc<dyn SeriesProvider>> {
        self.providers
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| DataError::ProviderNotConfigured(name.to_string()))
    }

    /// Look up the provider serving `dataset`.
    ///
    /// # Errors
    /// Returns [`DataError::ProviderNotConfigured`] if the dataset's provider
    /// is not registered.
    pub fn provider_for(&self, dataset: &DatasetId) -> Result<Arc<dyn SeriesProvider>> {
        self.get(dataset.provider())
    }

    /// Returns true if a provider is registered under `name`.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(&name.to_lowercase())
    }

    /// Registered provider names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered providers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Returns true if no provider is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    // Builder methods for easy setup with specific providers

    /// Add the AMDA provider.
    ///
    /// # Errors
    /// Returns an error if the provider cannot be built from `config`.
    #[cfg(feature = "amda")]
    pub fn with_amda(self, config: heliodata_amda::AmdaConfig) -> Result<Self> {
        let provider = Arc::new(heliodata_amda::AmdaProvider::with_config(config)?);
        Ok(self.with_provider(provider))
    }
}
