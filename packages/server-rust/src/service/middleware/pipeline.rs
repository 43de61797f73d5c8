//! Pipeline composition: wraps the execution router in its middleware stack.

use meshbus_core::ServiceCallResult;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;

use super::metrics::MetricsLayer;
use crate::service::operation::{ExecutionError, Invocation};
use crate::service::router::ExecutionRouter;

/// Type-erased, cloneable execution pipeline shared by every request.
pub type ExecutionPipeline = BoxCloneService<Invocation, ServiceCallResult, ExecutionError>;

/// Build the execution pipeline around `router`.
///
/// `MetricsLayer` sits directly on the router so recorded durations cover
/// resolution plus execution only.
#[must_use]
pub fn build_execution_pipeline(router: ExecutionRouter) -> ExecutionPipeline {
    BoxCloneService::new(ServiceBuilder::new().layer(MetricsLayer).service(router))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
