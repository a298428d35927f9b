//! Named provider registry.

use crate::error::{Error, Result};
use std::collections::HashMap;

/// Maps names to providers (tiers, transports, lock factories, caches)
/// registered at startup.
///
/// # Example
///
/// ```
/// use hybrid_cache_kit::ProviderRegistry;
///
/// let mut registry = ProviderRegistry::new();
/// registry.register("primary", 1).unwrap();
/// assert_eq!(*registry.get("primary").unwrap(), 1);
/// assert!(registry.get("secondary").is_err());
/// ```
pub struct ProviderRegistry<P> {
    providers: HashMap<String, P>,
}

impl<P> Default for ProviderRegistry<P> {
    fn default() -> Self {
        ProviderRegistry {
            providers: HashMap::new(),
        }
    }
}

impl<P> ProviderRegistry<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `Error::ConfigError` if `name` is empty or already taken.
    pub fn register(&mut self, name: impl Into<String>, provider: P) -> Result<()> {
        let name = name.into();
        if name.is_empty() {
            return Err(Error::ConfigError(
                "provider name must not be empty".to_string(),
            ));
        }
        if self.providers.contains_key(&name) {
            return Err(Error::ConfigError(format!(
                "provider '{}' is already registered",
                name
            )));
        }
        debug!("Registered provider {}", name);
        self.providers.insert(name, provider);
        Ok(())
    }

    /// # Errors
    /// Returns `Error::NotFound` if nothing is registered under `name`.
    pub fn get(&self, name: &str) -> Result<&P> {
        self.providers
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("no provider registered as '{}'", name)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
