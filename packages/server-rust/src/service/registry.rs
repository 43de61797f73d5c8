use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use meshbus_core::definition::normalize_version;
use meshbus_core::{ServiceDefinition, LATEST_VERSION};
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::implementation::ServiceImplementation;

// ---------------------------------------------------------------------------
// ServiceRegistry
// ---------------------------------------------------------------------------

/// Alias/version to definition mapping of one provider instance.
///
/// Written during the provider's startup, read by every inbound request
/// afterwards.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    by_alias: RwLock<HashMap<String, BTreeMap<i32, ServiceDefinition>>>,
}

impl ServiceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `definition` under its alias and normalized version.
    ///
    /// Re-registering an existing version replaces it and logs a warning.
    pub fn register(&self, mut definition: ServiceDefinition) {
        definition.service_version = normalize_version(definition.service_version);
        let version = definition.service_version;
        let alias = definition.service_alias.clone();

        let mut by_alias = self.by_alias.write();
        let versions = by_alias.entry(alias.clone()).or_default();
        if let Some(previous) = versions.insert(version, definition) {
            warn!(
                target: "meshbus::esb",
                alias = %alias,
                version,
                replaced = %previous.service_class_name,
                "service definition overwritten"
            );
        } else {
            debug!(target: "meshbus::esb", alias = %alias, version, "service definition registered");
        }
    }

    /// Resolves `alias` at `version`.
    ///
    /// [`LATEST_VERSION`] (`0`) picks the numerically highest registered
    /// version; any other value must match exactly.
    #[must_use]
    pub fn resolve(&self, alias: &str, version: i32) -> Option<ServiceDefinition> {
        let by_alias = self.by_alias.read();
        let versions = by_alias.get(alias)?;
        if version == LATEST_VERSION {
            versions.values().next_back().cloned()
        } else {
            versions.get(&version).cloned()
        }
    }

    /// Registered versions of `alias`, ascending.
    #[must_use]
    pub fn versions(&self, alias: &str) -> Vec<i32> {
        self.by_alias
            .read()
            .get(alias)
            .map(|v| v.keys().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_alias.read().values().map(BTreeMap::len).sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// ServiceFactories
// ---------------------------------------------------------------------------

/// Constructor of one service implementation.
pub type ServiceFactory = Arc<dyn Fn() -> Arc<dyn ServiceImplementation> + Send + Sync>;

/// Implementation locator (`serviceClassName`) to constructor.
#[derive(Default, Clone)]
pub struct ServiceFactories {
    by_class: Arc<RwLock<HashMap<String, ServiceFactory>>>,
}

impl ServiceFactories {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a constructor under `class_name`, replacing any earlier one.
    pub fn register<F, S>(&self, class_name: impl Into<String>, factory: F)
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: ServiceImplementation + 'static,
    {
        let factory: ServiceFactory =
            Arc::new(move || -> Arc<dyn ServiceImplementation> { Arc::new(factory()) });
        self.by_class.write().insert(class_name.into(), factory);
    }

    /// Builds a fresh implementation for `class_name`.
    #[must_use]
    pub fn instantiate(&self, class_name: &str) -> Option<Arc<dyn ServiceImplementation>> {
        let factory = self.by_class.read().get(class_name).cloned()?;
        Some(factory())
    }

    #[must_use]
    pub fn contains(&self, class_name: &str) -> bool {
        self.by_class.read().contains_key(class_name)
    }
}

impl fmt::Debug for ServiceFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<String> = self.by_class.read().keys().cloned().collect();
        names.sort();
        f.debug_struct("ServiceFactories").field("classes", &names).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct Unimplemented;

    impl ServiceImplementation for Unimplemented {}

    fn def(alias: &str, class: &str, version: i32) -> ServiceDefinition {
        ServiceDefinition::new(alias, class, version)
    }

    #[test]
    fn latest_picks_highest_version() {
        let registry = ServiceRegistry::new();
        registry.register(def("X", "Impl2", 2));
        registry.register(def("X", "Impl3", 3));
        registry.register(def("X", "Impl1", 1));

        assert_eq!(registry.resolve("X", 0).unwrap().service_version, 3);
        assert_eq!(registry.resolve("X", 2).unwrap().service_class_name, "Impl2");
        assert!(registry.resolve("X", 4).is_none());
        assert!(registry.resolve("Y", 0).is_none());
        assert_eq!(registry.versions("X"), vec![1, 2, 3]);
    }

    #[test]
    fn highest_wins_over_most_recent() {
        let registry = ServiceRegistry::new();
        registry.register(def("X", "Impl5", 5));
        registry.register(def("X", "Impl2", 2));
        assert_eq!(registry.resolve("X", 0).unwrap().service_class_name, "Impl5");
    }

    #[test]
    fn non_positive_versions_normalize_to_one() {
        let registry = ServiceRegistry::new();
        let mut raw = def("X", "Impl", 1);
        raw.service_version = -4;
        registry.register(raw);
        assert_eq!(registry.resolve("X", 1).unwrap().service_version, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn overwrite_replaces_definition() {
        let registry = ServiceRegistry::new();
        registry.register(def("X", "Old", 1));
        registry.register(def("X", "New", 1));
        assert_eq!(registry.resolve("X", 1).unwrap().service_class_name, "New");
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn factories_build_fresh_instances() {
        let factories = ServiceFactories::new();
        factories.register("Unimplemented", || Unimplemented);
        assert!(factories.contains("Unimplemented"));
        assert!(factories.instantiate("Unimplemented").is_some());
        assert!(factories.instantiate("Missing").is_none());
        assert!(format!("{factories:?}").contains("Unimplemented"));
    }
}
