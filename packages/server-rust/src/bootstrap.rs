//! Bootstrap loader: resolves the configured microservice by name and starts
//! it on a transport.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::bus::Transport;
use crate::service::{BusConfig, Microservice, MicroserviceHost};

/// Constructs a fresh microservice instance.
pub type MicroserviceFactory = Arc<dyn Fn() -> Arc<dyn Microservice> + Send + Sync>;

/// Errors that abort startup.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("unknown microservice class: {0}")]
    UnknownMicroservice(String),

    #[error("service domain name is not configured")]
    MissingDomain,

    #[error("microservice {name} failed to start: {source}")]
    Start {
        name: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Name -> factory table of the microservices a node can run.
#[derive(Clone, Default)]
pub struct MicroserviceCatalog {
    entries: BTreeMap<String, MicroserviceFactory>,
}

impl MicroserviceCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `name`, replacing any earlier entry with the same name.
    #[must_use]
    pub fn register<F, M>(mut self, name: &str, factory: F) -> Self
    where
        F: Fn() -> M + Send + Sync + 'static,
        M: Microservice,
    {
        let factory: MicroserviceFactory =
            Arc::new(move || -> Arc<dyn Microservice> { Arc::new(factory()) });
        self.entries.insert(name.to_string(), factory);
        self
    }

    #[must_use]
    pub fn create(&self, name: &str) -> Option<Arc<dyn Microservice>> {
        self.entries.get(name).map(|factory| factory())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}

impl fmt::Debug for MicroserviceCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicroserviceCatalog")
            .field("names", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Starts the microservice named by `config.service_class`.
///
/// # Errors
///
/// - [`BootstrapError::MissingDomain`] if no domain is configured.
/// - [`BootstrapError::UnknownMicroservice`] if the catalog has no such name.
/// - [`BootstrapError::Start`] if the microservice's `start` hook fails.
pub async fn launch(
    config: BusConfig,
    catalog: &MicroserviceCatalog,
    transport: Arc<dyn Transport>,
) -> Result<MicroserviceHost, BootstrapError> {
    if config.service_domain_name.is_empty() {
        return Err(BootstrapError::MissingDomain);
    }
    let microservice = catalog
        .create(&config.service_class)
        .ok_or_else(|| BootstrapError::UnknownMicroservice(config.service_class.clone()))?;

    info!(
        target: "meshbus::esb",
        service_class = %config.service_class,
        domain = %config.service_domain_name,
        instance_id = %config.instance_id,
        "launching microservice"
    );
    MicroserviceHost::start(microservice, config, transport).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBroker;
    use crate::service::Roles;

    struct Idle;

    impl Microservice for Idle {
        fn name(&self) -> &str {
            "Idle"
        }

        fn roles(&self) -> Roles {
            Roles::CALLER
        }
    }

    fn make_config(domain: &str, class: &str) -> BusConfig {
        BusConfig {
            service_class: class.to_string(),
            shutdown_grace_ms: 200,
            ..BusConfig::for_domain(domain)
        }
    }

    #[test]
    fn catalog_lists_sorted_names() {
        let catalog = MicroserviceCatalog::new()
            .register("Zeta", || Idle)
            .register("Alpha", || Idle);
        assert_eq!(catalog.names().collect::<Vec<_>>(), vec!["Alpha", "Zeta"]);
        assert!(catalog.contains("Alpha"));
        assert_eq!(catalog.create("Zeta").unwrap().name(), "Idle");
        assert!(catalog.create("Nope").is_none());
    }

    #[tokio::test]
    async fn unknown_class_is_rejected() {
        let catalog = MicroserviceCatalog::new().register("Idle", || Idle);
        let err = launch(make_config("X", "Missing"), &catalog, Arc::new(InMemoryBroker::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::UnknownMicroservice(ref n) if n == "Missing"));
    }

    #[tokio::test]
    async fn empty_domain_is_rejected() {
        let catalog = MicroserviceCatalog::new().register("Idle", || Idle);
        let err = launch(make_config("", "Idle"), &catalog, Arc::new(InMemoryBroker::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, BootstrapError::MissingDomain));
    }

    #[tokio::test]
    async fn launches_known_class() {
        let catalog = MicroserviceCatalog::new().register("Idle", || Idle);
        let host = launch(make_config("X", "Idle"), &catalog, Arc::new(InMemoryBroker::new()))
            .await
            .unwrap();
        assert_eq!(host.name(), "Idle");
        assert!(host.caller().is_some());
        assert!(host.stop().await);
    }
}
