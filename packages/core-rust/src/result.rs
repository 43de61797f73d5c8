//! Service call results and captured failures.
//!
//! A failure is captured as plain data (kind, message, originating hop) so it
//! can cross the wire. Live error values never leave the process that
//! produced them.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::DataObject;

/// Classification of a captured failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// No definition is registered for the requested alias/version.
    ServiceNotFound,
    /// The implementation did not provide an execution body.
    NotImplemented,
    /// The implementation ran and failed, or declared a failure.
    ExecutionFailed,
    /// The call could not be handed to the transport.
    DispatchFailed,
    /// No response arrived before the pending handle's deadline.
    Timeout,
    /// The pending handle was torn down without a response.
    Abandoned,
    /// A response arrived but carried no usable result.
    MalformedResponse,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ServiceNotFound => "service not found",
            Self::NotImplemented => "not implemented",
            Self::ExecutionFailed => "execution failed",
            Self::DispatchFailed => "dispatch failed",
            Self::Timeout => "timeout",
            Self::Abandoned => "abandoned",
            Self::MalformedResponse => "malformed response",
        };
        f.write_str(s)
    }
}

/// A failure captured into a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFailure {
    pub kind: FailureKind,
    pub message: String,
    /// `"{domain}-{instance}"` of the hop where the failure was captured.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub hop: Option<String>,
}

impl CallFailure {
    #[must_use]
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            hop: None,
        }
    }

    /// Stamps the originating hop, keeping an already stamped one.
    #[must_use]
    pub fn at_hop(mut self, hop: impl Into<String>) -> Self {
        if self.hop.is_none() {
            self.hop = Some(hop.into());
        }
        self
    }
}

impl fmt::Display for CallFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.hop {
            Some(hop) => write!(f, "{}: {} (at {hop})", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Outcome of a service call as observed by the caller.
///
/// Callers only ever see "got a result, check its success flag".
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallResult {
    pub is_successful: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure: Option<CallFailure>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<DataObject>,
}

impl ServiceCallResult {
    /// A successful result carrying `payload`.
    #[must_use]
    pub fn success(payload: DataObject) -> Self {
        Self {
            is_successful: true,
            failure: None,
            payload: Some(payload),
        }
    }

    /// A successful result with no payload.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            is_successful: true,
            failure: None,
            payload: None,
        }
    }

    #[must_use]
    pub fn failure(failure: CallFailure) -> Self {
        Self {
            is_successful: false,
            failure: Some(failure),
            payload: None,
        }
    }

    /// Shorthand for `failure(CallFailure::new(kind, message))`.
    #[must_use]
    pub fn failed(kind: FailureKind, message: impl Into<String>) -> Self {
        Self::failure(CallFailure::new(kind, message))
    }

    /// Looks up a payload field.
    #[must_use]
    pub fn payload_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.payload.as_ref().and_then(|p| p.get(key))
    }
}
