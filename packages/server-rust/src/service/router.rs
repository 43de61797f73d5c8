//! Execution routing: resolves an invocation to an implementation and runs it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use meshbus_core::ServiceCallResult;
use tower::Service;

use super::operation::{ExecutionError, Invocation};
use super::registry::{ServiceFactories, ServiceRegistry};

type BoxedFuture = Pin<Box<dyn Future<Output = Result<ServiceCallResult, ExecutionError>> + Send>>;

/// Routes invocations through the provider's registry and factories.
///
/// Resolution uses `(alias, version)` with version `0` meaning the highest
/// registered version. Each invocation gets a fresh implementation instance.
#[derive(Debug, Clone)]
pub struct ExecutionRouter {
    registry: Arc<ServiceRegistry>,
    factories: ServiceFactories,
}

impl ExecutionRouter {
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>, factories: ServiceFactories) -> Self {
        Self {
            registry,
            factories,
        }
    }
}

impl Service<Invocation> for ExecutionRouter {
    type Response = ServiceCallResult;
    type Error = ExecutionError;
    type Future = BoxedFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let resolved = self
            .registry
            .resolve(&invocation.alias, invocation.version)
            .ok_or_else(|| ExecutionError::ServiceNotFound {
                alias: invocation.alias.clone(),
                version: invocation.version,
            })
            .and_then(|definition| {
                self.factories
                    .instantiate(&definition.service_class_name)
                    .map(|implementation| (definition.clone(), implementation))
                    .ok_or(ExecutionError::FactoryMissing {
                        class_name: definition.service_class_name,
                    })
            });

        Box::pin(async move {
            let (definition, implementation) = resolved?;
            let result = implementation
                .execute(&definition, &invocation.params, &invocation.context)
                .await?;
            Ok(result)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use meshbus_core::{data_object, DataObject, FailureKind, ServiceDefinition};
    use tower::ServiceExt;

    use super::*;
    use crate::service::context::ServiceCallContext;
    use crate::service::implementation::ServiceImplementation;

    struct Versioned(&'static str);

    #[async_trait]
    impl ServiceImplementation for Versioned {
        async fn execute(
            &self,
            definition: &ServiceDefinition,
            _params: &DataObject,
            _ctx: &ServiceCallContext,
        ) -> anyhow::Result<ServiceCallResult> {
            Ok(ServiceCallResult::success(data_object([
                ("impl", self.0.to_string()),
                ("version", definition.service_version.to_string()),
            ])))
        }
    }

    struct Failing;

    #[async_trait]
    impl ServiceImplementation for Failing {
        async fn execute(
            &self,
            _definition: &ServiceDefinition,
            _params: &DataObject,
            _ctx: &ServiceCallContext,
        ) -> anyhow::Result<ServiceCallResult> {
            anyhow::bail!("database unreachable")
        }
    }

    struct Unimplemented;

    impl ServiceImplementation for Unimplemented {}

    fn make_router() -> ExecutionRouter {
        let registry = Arc::new(ServiceRegistry::new());
        registry.register(ServiceDefinition::new("echo", "EchoV1", 1));
        registry.register(ServiceDefinition::new("echo", "EchoV2", 2));
        registry.register(ServiceDefinition::new("broken", "Failing", 1));
        registry.register(ServiceDefinition::new("todo", "Unimplemented", 1));
        registry.register(ServiceDefinition::new("orphan", "NoFactory", 1));

        let factories = ServiceFactories::new();
        factories.register("EchoV1", || Versioned("v1"));
        factories.register("EchoV2", || Versioned("v2"));
        factories.register("Failing", || Failing);
        factories.register("Unimplemented", || Unimplemented);
        ExecutionRouter::new(registry, factories)
    }

    fn make_invocation(alias: &str, version: i32) -> Invocation {
        Invocation {
            service_call_id: "TSC-test".to_string(),
            alias: alias.to_string(),
            version,
            params: DataObject::new(),
            context: Arc::new(ServiceCallContext::default()),
        }
    }

    #[tokio::test]
    async fn latest_routes_to_highest_version() {
        let result = make_router().oneshot(make_invocation("echo", 0)).await.unwrap();
        assert_eq!(result.payload_field("impl"), Some(&"v2".into()));
    }

    #[tokio::test]
    async fn exact_version_routes_exactly() {
        let result = make_router().oneshot(make_invocation("echo", 1)).await.unwrap();
        assert_eq!(result.payload_field("impl"), Some(&"v1".into()));
    }

    #[tokio::test]
    async fn unknown_alias_is_not_found() {
        let err = make_router().oneshot(make_invocation("nope", 0)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::ServiceNotFound { ref alias, .. } if alias == "nope"));
    }

    #[tokio::test]
    async fn missing_factory_is_reported() {
        let err = make_router().oneshot(make_invocation("orphan", 1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::FactoryMissing { .. }));
    }

    #[tokio::test]
    async fn implementation_error_becomes_failed() {
        let err = make_router().oneshot(make_invocation("broken", 1)).await.unwrap_err();
        assert!(err.to_string().contains("database unreachable"));
    }

    #[tokio::test]
    async fn default_execute_is_not_implemented() {
        let result = make_router().oneshot(make_invocation("todo", 1)).await.unwrap();
        assert!(!result.is_successful);
        assert_eq!(result.failure.unwrap().kind, FailureKind::NotImplemented);
    }
}
