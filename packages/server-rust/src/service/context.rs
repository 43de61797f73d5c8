use meshbus_core::{DataObject, ServiceAddress, ServiceCall, ServiceCallResult};
use parking_lot::Mutex;

use super::caller::ServiceCaller;
use crate::bus::TaskHandle;

/// Per-execution context handed to a service implementation.
///
/// Carries the call being served (absent for calls originated outside any
/// service execution), the caller's auth token, and the caller capability
/// used for nested calls. Ids of nested calls are recorded as successors.
#[derive(Debug, Default)]
pub struct ServiceCallContext {
    call: Option<ServiceCall>,
    auth_token: Option<String>,
    caller: Option<ServiceCaller>,
    successors: Mutex<Vec<String>>,
}

impl ServiceCallContext {
    /// Context for calls that start a new transaction.
    #[must_use]
    pub fn root(caller: Option<ServiceCaller>) -> Self {
        Self {
            caller,
            ..Self::default()
        }
    }

    /// Context for executing `call`; nested calls become its children.
    #[must_use]
    pub fn for_call(call: ServiceCall, caller: Option<ServiceCaller>) -> Self {
        Self {
            call: Some(call),
            caller,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    #[must_use]
    pub fn service_call(&self) -> Option<&ServiceCall> {
        self.call.as_ref()
    }

    #[must_use]
    pub fn auth_token(&self) -> Option<&str> {
        self.auth_token.as_deref()
    }

    #[must_use]
    pub fn caller(&self) -> Option<&ServiceCaller> {
        self.caller.as_ref()
    }

    pub fn record_successor(&self, service_call_id: impl Into<String>) {
        self.successors.lock().push(service_call_id.into());
    }

    #[must_use]
    pub fn successors(&self) -> Vec<String> {
        self.successors.lock().clone()
    }

    pub fn take_successors(&self) -> Vec<String> {
        std::mem::take(&mut *self.successors.lock())
    }

    /// Starts a nested call. Without a caller capability the handle resolves
    /// immediately with a dispatch failure.
    pub async fn call_async(&self, address: &ServiceAddress, params: DataObject) -> TaskHandle {
        match &self.caller {
            Some(caller) => caller.call_async(address, params, self).await,
            None => ServiceCaller::unavailable(address),
        }
    }

    /// Nested call, awaited to completion.
    pub async fn call(&self, address: &ServiceAddress, params: DataObject) -> ServiceCallResult {
        self.call_async(address, params).await.await
    }
}
