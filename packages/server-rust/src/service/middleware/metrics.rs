//! Metrics middleware for service executions.
//!
//! Wraps each execution in an `info_span!` carrying alias, call id, duration
//! and outcome, and emits one `execution complete` event per invocation.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use meshbus_core::ServiceCallResult;
use tower::{Layer, Service};
use tracing::{info_span, Instrument};

use crate::service::operation::{ExecutionError, Invocation};

// ---------------------------------------------------------------------------
// MetricsLayer
// ---------------------------------------------------------------------------

/// Tower layer that instruments executions with timing and outcome.
#[derive(Debug, Clone)]
pub struct MetricsLayer;

impl<S> Layer<S> for MetricsLayer {
    type Service = MetricsService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        MetricsService { inner }
    }
}

// ---------------------------------------------------------------------------
// MetricsService
// ---------------------------------------------------------------------------

/// Service wrapper that records execution duration and outcome.
#[derive(Debug, Clone)]
pub struct MetricsService<S> {
    inner: S,
}

impl<S> Service<Invocation> for MetricsService<S>
where
    S: Service<Invocation, Response = ServiceCallResult, Error = ExecutionError> + Send,
    S::Future: Send + 'static,
{
    type Response = ServiceCallResult;
    type Error = ExecutionError;
    type Future = Pin<Box<dyn Future<Output = Result<ServiceCallResult, ExecutionError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, invocation: Invocation) -> Self::Future {
        let alias = invocation.alias.clone();
        let call_id = invocation.service_call_id.clone();

        let span = info_span!(
            target: "meshbus::trace",
            "execution",
            alias = %alias,
            service_call_id = %call_id,
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let fut = self.inner.call(invocation);

        Box::pin(
            async move {
                let start = Instant::now();
                let result = fut.await;

                let outcome = match &result {
                    Ok(r) if r.is_successful => "ok",
                    Ok(_) => "failed",
                    Err(_) => "error",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = start.elapsed().as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);

                tracing::info!(
                    target: "meshbus::trace",
                    alias = %alias,
                    service_call_id = %call_id,
                    duration_ms,
                    outcome,
                    "execution complete"
                );
                #[allow(clippy::cast_precision_loss)]
                let duration_f64 = duration_ms as f64;
                metrics::histogram!("meshbus_execution_duration_ms", "outcome" => outcome)
                    .record(duration_f64);

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
