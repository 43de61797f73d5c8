//! Caller capability: originating calls and turning every failure into a result.

use std::sync::Arc;

use meshbus_core::{
    CallFailure, CorrelationKey, DataObject, FailureKind, ServiceAddress, ServiceCall,
    ServiceCallDestination, ServiceCallResult,
};
use tracing::{debug, warn};

use super::context::ServiceCallContext;
use crate::bus::{Dispatcher, TaskHandle};

/// Originates calls through a dispatcher.
///
/// Cheap to clone; every clone shares the same dispatcher.
#[derive(Debug, Clone)]
pub struct ServiceCaller {
    dispatcher: Arc<Dispatcher>,
}

impl ServiceCaller {
    #[must_use]
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    #[must_use]
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Builds and sends a call to `address`, returning its pending handle.
    ///
    /// The call is a child of `ctx`'s current call when there is one, and a
    /// new root call otherwise. A send failure never escapes: the returned
    /// handle is then already resolved with a `DispatchFailed` result.
    pub async fn call_async(
        &self,
        address: &ServiceAddress,
        params: DataObject,
        ctx: &ServiceCallContext,
    ) -> TaskHandle {
        let source = self.dispatcher.identity().clone();
        let destination = ServiceCallDestination::new(address, params);
        let clock = self.dispatcher.clock();
        let mut call = match ctx.service_call() {
            Some(parent) => ServiceCall::child(parent, source, destination, clock),
            None => ServiceCall::root(source, destination, clock),
        };
        ctx.record_successor(call.service_call_id());

        debug!(
            target: "meshbus::trace",
            transaction_id = call.transaction_id(),
            service_call_id = call.service_call_id(),
            level = call.level(),
            target_service = %address,
            "calling service"
        );

        match self.dispatcher.send_request(&mut call).await {
            Ok(handle) => handle,
            Err(err) => {
                warn!(
                    target: "meshbus::esb",
                    service_call_id = call.service_call_id(),
                    target_service = %address,
                    %err,
                    "call could not be sent"
                );
                let failure = err.to_failure().at_hop(self.dispatcher.identity().hop_name());
                TaskHandle::resolved(call.correlation_key(), ServiceCallResult::failure(failure))
            }
        }
    }

    /// Sends a call and waits for its result.
    pub async fn call(
        &self,
        address: &ServiceAddress,
        params: DataObject,
        ctx: &ServiceCallContext,
    ) -> ServiceCallResult {
        self.call_async(address, params, ctx).await.await
    }

    /// Handle for a call attempted without any caller capability.
    #[must_use]
    pub fn unavailable(address: &ServiceAddress) -> TaskHandle {
        TaskHandle::resolved(
            CorrelationKey::new("unsent", 0),
            ServiceCallResult::failure(CallFailure::new(
                FailureKind::DispatchFailed,
                format!("no caller capability to reach {address}"),
            )),
        )
    }
}
