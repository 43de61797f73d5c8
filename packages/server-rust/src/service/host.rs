use std::sync::Arc;

use tracing::{error, info};

use super::caller::ServiceCaller;
use super::config::BusConfig;
use super::microservice::{Microservice, Roles, StartContext};
use super::provider::RequestProcessor;
use super::registry::{ServiceFactories, ServiceRegistry};
use crate::bootstrap::BootstrapError;
use crate::bus::{Dispatcher, InboundHandler, Transport};

/// A running microservice with the bus capabilities its roles ask for.
#[derive(Debug)]
pub struct MicroserviceHost {
    name: String,
    roles: Roles,
    config: Arc<BusConfig>,
    dispatcher: Arc<Dispatcher>,
    caller: Option<ServiceCaller>,
    provider: Option<Arc<RequestProcessor>>,
    microservice: Arc<dyn Microservice>,
}

impl MicroserviceHost {
    /// Wires `microservice` onto the bus and starts it.
    ///
    /// Order: response consumer (callers), `Microservice::start`, then the
    /// request consumer (providers). A consumer that cannot be configured is
    /// logged and leaves that part of the bus idle; it does not fail startup.
    ///
    /// # Errors
    ///
    /// Returns [`BootstrapError::Start`] if the microservice's `start` fails.
    pub async fn start(
        microservice: Arc<dyn Microservice>,
        config: BusConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, BootstrapError> {
        let config = Arc::new(config);
        let name = microservice.name().to_string();
        let roles = microservice.roles();
        let dispatcher = Dispatcher::new(&config, transport);

        let caller = roles
            .is_caller()
            .then(|| ServiceCaller::new(Arc::clone(&dispatcher)));
        if caller.is_some() {
            if let Err(err) = dispatcher.configure_service_consumer().await {
                error!(
                    target: "meshbus::esb",
                    critical = true,
                    microservice = %name,
                    %err,
                    "failed to configure response consumer, bus not functional"
                );
            }
        }

        let registry = Arc::new(ServiceRegistry::new());
        let factories = ServiceFactories::new();
        let ctx = StartContext::new(
            Arc::clone(&config),
            Arc::clone(&registry),
            factories.clone(),
            caller.clone(),
        );
        if let Err(source) = microservice.start(&ctx).await {
            dispatcher.shutdown().await;
            return Err(BootstrapError::Start { name, source });
        }

        let provider = if roles.is_provider() {
            let processor = Arc::new(RequestProcessor::new(
                Arc::clone(&dispatcher),
                registry,
                factories,
                caller.clone(),
            ));
            let handler: Arc<dyn InboundHandler> = processor.clone();
            if let Err(err) = dispatcher.configure_service_provider(handler).await {
                error!(
                    target: "meshbus::esb",
                    critical = true,
                    microservice = %name,
                    %err,
                    "failed to configure request consumer, bus not functional"
                );
            }
            Some(processor)
        } else {
            None
        };

        info!(
            target: "meshbus::esb",
            microservice = %name,
            domain = %config.service_domain_name,
            instance_id = %config.instance_id,
            caller = roles.is_caller(),
            provider = roles.is_provider(),
            "microservice started"
        );

        Ok(Self {
            name,
            roles,
            config,
            dispatcher,
            caller,
            provider,
            microservice,
        })
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn roles(&self) -> Roles {
        self.roles
    }

    #[must_use]
    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    #[must_use]
    pub fn caller(&self) -> Option<&ServiceCaller> {
        self.caller.as_ref()
    }

    #[must_use]
    pub fn provider(&self) -> Option<&Arc<RequestProcessor>> {
        self.provider.as_ref()
    }

    /// Stops the microservice, then the dispatcher.
    ///
    /// Returns `true` if in-flight requests drained within the grace period.
    pub async fn stop(&self) -> bool {
        if let Err(err) = self.microservice.stop().await {
            error!(target: "meshbus::esb", microservice = %self.name, %err, "microservice stop failed");
        }
        let drained = self.dispatcher.shutdown().await;
        info!(target: "meshbus::esb", microservice = %self.name, drained, "microservice stopped");
        drained
    }
}
