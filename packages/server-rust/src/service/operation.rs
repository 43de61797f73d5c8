//! Invocation type flowing through the execution pipeline and its errors.

use std::sync::Arc;

use meshbus_core::{CallFailure, DataObject, FailureKind, ServiceCall};

use super::context::ServiceCallContext;

/// One execution of a resolved request, as seen by the tower pipeline.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub service_call_id: String,
    pub alias: String,
    pub version: i32,
    pub params: DataObject,
    pub context: Arc<ServiceCallContext>,
}

impl Invocation {
    /// Invocation of `call`'s destination under `context`.
    #[must_use]
    pub fn for_call(call: &ServiceCall, context: Arc<ServiceCallContext>) -> Self {
        Self {
            service_call_id: call.service_call_id().to_string(),
            alias: call.destination.service_alias.clone(),
            version: call.destination.service_version,
            params: call.destination.service_params.clone(),
            context,
        }
    }
}

/// Errors raised while resolving or running a service implementation.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("service definition not found: {alias} v{version}")]
    ServiceNotFound { alias: String, version: i32 },
    #[error("no implementation factory registered for {class_name}")]
    FactoryMissing { class_name: String },
    #[error("service implementation panicked: {0}")]
    Panicked(String),
    #[error("execution failed: {0:#}")]
    Failed(#[from] anyhow::Error),
}

impl ExecutionError {
    #[must_use]
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::ServiceNotFound { .. } => FailureKind::ServiceNotFound,
            Self::FactoryMissing { .. } => FailureKind::NotImplemented,
            Self::Panicked(_) | Self::Failed(_) => FailureKind::ExecutionFailed,
        }
    }

    /// Failure description captured into the call's result.
    #[must_use]
    pub fn to_failure(&self) -> CallFailure {
        CallFailure::new(self.kind(), self.to_string())
    }
}
