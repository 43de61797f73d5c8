//! Execution contract of a service implementation.

use async_trait::async_trait;
use meshbus_core::{DataObject, FailureKind, ServiceCallResult, ServiceDefinition};

use super::context::ServiceCallContext;

/// A concrete service a provider can execute.
///
/// Business failures are returned as a failed [`ServiceCallResult`]; an `Err`
/// is captured by the provider as an execution failure. Neither reaches the
/// caller as anything but a result value.
#[async_trait]
pub trait ServiceImplementation: Send + Sync {
    /// Executes the service for one call.
    ///
    /// Nested calls made through `ctx` run to completion before this returns.
    async fn execute(
        &self,
        definition: &ServiceDefinition,
        _params: &DataObject,
        _ctx: &ServiceCallContext,
    ) -> anyhow::Result<ServiceCallResult> {
        Ok(ServiceCallResult::failed(
            FailureKind::NotImplemented,
            format!("execution of {definition} is not implemented"),
        ))
    }
}
