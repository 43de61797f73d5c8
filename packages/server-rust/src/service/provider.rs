//! Provider-side request processing.
//!
//! Every request pulled from the domain's requests-in queue moves through
//! `Received -> AdmissionChecked -> {Executing | Rejected}`, and an executed
//! request continues `-> ResultCaptured -> ResponseSent`. The admission slot
//! taken at `Executing` is held by an RAII permit until `ResponseSent`, so it
//! is released on every exit path.

use std::sync::Arc;

use async_trait::async_trait;
use meshbus_core::{ServiceCall, ServiceCallResult};
use parking_lot::Mutex;
use tower::ServiceExt;
use tracing::{debug, error, trace};

use super::caller::ServiceCaller;
use super::context::ServiceCallContext;
use super::middleware::{build_execution_pipeline, ExecutionPipeline};
use super::operation::{ExecutionError, Invocation};
use super::registry::{ServiceFactories, ServiceRegistry};
use super::router::ExecutionRouter;
use crate::bus::{Dispatcher, Envelope, InboundHandler};

/// Stages of one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Received,
    AdmissionChecked,
    Rejected,
    Executing,
    ResultCaptured,
    ResponseSent,
}

impl RequestState {
    /// `true` for states that end processing on this instance.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::ResponseSent)
    }

    fn advance(&mut self, next: RequestState, service_call_id: &str) {
        trace!(
            target: "meshbus::trace",
            service_call_id,
            from = ?*self,
            to = ?next,
            "request state"
        );
        *self = next;
    }
}

/// Executes inbound requests against the provider's registered services.
#[derive(Debug)]
pub struct RequestProcessor {
    dispatcher: Arc<Dispatcher>,
    registry: Arc<ServiceRegistry>,
    pipeline: Mutex<ExecutionPipeline>,
    caller: Option<ServiceCaller>,
}

impl RequestProcessor {
    /// `caller` is handed to implementations for nested calls.
    #[must_use]
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        registry: Arc<ServiceRegistry>,
        factories: ServiceFactories,
        caller: Option<ServiceCaller>,
    ) -> Self {
        let router = ExecutionRouter::new(Arc::clone(&registry), factories);
        Self {
            dispatcher,
            registry,
            pipeline: Mutex::new(build_execution_pipeline(router)),
            caller,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Runs one request through the state machine and returns its final state.
    pub async fn process(&self, mut call: ServiceCall, envelope: Envelope) -> RequestState {
        let service_call_id = call.service_call_id().to_string();
        let mut state = RequestState::Received;

        let permit = self.dispatcher.admit(&call);
        state.advance(RequestState::AdmissionChecked, &service_call_id);

        let Some(permit) = permit else {
            state.advance(RequestState::Rejected, &service_call_id);
            if let Err(err) = self.dispatcher.reject_request(&envelope, &call).await {
                error!(
                    target: "meshbus::esb",
                    service_call_id = %service_call_id,
                    %err,
                    "failed to re-enqueue rejected request"
                );
            }
            return state;
        };

        state.advance(RequestState::Executing, &service_call_id);
        let context = Arc::new(ServiceCallContext::for_call(call.clone(), self.caller.clone()));
        let outcome = self.execute(Invocation::for_call(&call, Arc::clone(&context))).await;

        let hop = self.dispatcher.identity().hop_name();
        let result = match outcome {
            Ok(mut result) => {
                result.failure = result.failure.map(|f| f.at_hop(&hop));
                result
            }
            Err(err) => {
                debug!(
                    target: "meshbus::trace",
                    service_call_id = %service_call_id,
                    %err,
                    "execution failed"
                );
                ServiceCallResult::failure(err.to_failure().at_hop(&hop))
            }
        };
        call.successors.extend(context.take_successors());
        call.capture_result(result);
        state.advance(RequestState::ResultCaptured, &service_call_id);

        if let Err(err) = self.dispatcher.send_service_response(call, permit).await {
            error!(
                target: "meshbus::esb",
                service_call_id = %service_call_id,
                %err,
                "failed to send response"
            );
        }
        state.advance(RequestState::ResponseSent, &service_call_id);
        state
    }

    /// Runs the pipeline on its own task so a panicking implementation
    /// surfaces as an execution failure.
    async fn execute(&self, invocation: Invocation) -> Result<ServiceCallResult, ExecutionError> {
        let pipeline = self.pipeline.lock().clone();
        match tokio::spawn(pipeline.oneshot(invocation)).await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(ExecutionError::Panicked(join_err.to_string())),
        }
    }
}

#[async_trait]
impl InboundHandler for RequestProcessor {
    async fn handle_request(&self, call: ServiceCall, envelope: Envelope) {
        self.process(call, envelope).await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
