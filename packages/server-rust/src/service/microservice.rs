//! Microservice composition: capabilities instead of a class hierarchy.
//!
//! A microservice declares which [`Roles`] it plays. The host gives every
//! caller a [`ServiceCaller`]; a provider additionally gets a request
//! processor fed from its domain's requests-in queue, with the services it
//! registers through [`StartContext`] during `start`.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use meshbus_core::ServiceDefinition;

use super::caller::ServiceCaller;
use super::config::BusConfig;
use super::implementation::ServiceImplementation;
use super::registry::{ServiceFactories, ServiceRegistry};

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Capabilities a microservice needs from the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    caller: bool,
    provider: bool,
}

impl Roles {
    /// Neither originates nor serves calls.
    pub const NONE: Roles = Roles {
        caller: false,
        provider: false,
    };
    /// Originates calls only.
    pub const CALLER: Roles = Roles {
        caller: true,
        provider: false,
    };
    /// Serves calls, and can originate nested ones.
    pub const PROVIDER: Roles = Roles {
        caller: true,
        provider: true,
    };

    #[must_use]
    pub fn is_caller(self) -> bool {
        self.caller
    }

    #[must_use]
    pub fn is_provider(self) -> bool {
        self.provider
    }
}

// ---------------------------------------------------------------------------
// StartContext
// ---------------------------------------------------------------------------

/// What a microservice can reach while starting.
#[derive(Debug, Clone)]
pub struct StartContext {
    config: Arc<BusConfig>,
    registry: Arc<ServiceRegistry>,
    factories: ServiceFactories,
    caller: Option<ServiceCaller>,
}

impl StartContext {
    #[must_use]
    pub fn new(
        config: Arc<BusConfig>,
        registry: Arc<ServiceRegistry>,
        factories: ServiceFactories,
        caller: Option<ServiceCaller>,
    ) -> Self {
        Self {
            config,
            registry,
            factories,
            caller,
        }
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    /// Present when the microservice plays the caller role.
    #[must_use]
    pub fn caller(&self) -> Option<&ServiceCaller> {
        self.caller.as_ref()
    }

    pub fn register_service(&self, definition: ServiceDefinition) {
        self.registry.register(definition);
    }

    pub fn register_implementation<F, S>(&self, class_name: &str, factory: F)
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: ServiceImplementation + 'static,
    {
        self.factories.register(class_name, factory);
    }

    /// Registers `alias` at `version` together with the factory behind it.
    pub fn provide<F, S>(&self, alias: &str, class_name: &str, version: i32, factory: F)
    where
        F: Fn() -> S + Send + Sync + 'static,
        S: ServiceImplementation + 'static,
    {
        self.register_implementation(class_name, factory);
        self.register_service(ServiceDefinition::new(alias, class_name, version));
    }
}

// ---------------------------------------------------------------------------
// Microservice
// ---------------------------------------------------------------------------

/// A deployable unit hosted on the bus.
#[async_trait]
pub trait Microservice: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn roles(&self) -> Roles;

    /// Called once the caller capability is live and before the provider
    /// starts consuming requests.
    async fn start(&self, _ctx: &StartContext) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Access check for a caller token. Denies by default; the bus does not
    /// consult it.
    fn verify_access(&self, _auth_token: Option<&str>, _definition: &ServiceDefinition) -> bool {
        false
    }
}

impl fmt::Debug for dyn Microservice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Microservice")
            .field("name", &self.name())
            .field("roles", &self.roles())
            .finish()
    }
}
