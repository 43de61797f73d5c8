//! The service call envelope: identity, lineage, sequencing, and routing.
//!
//! A `ServiceCall` is the unit of work traveling the bus. It is owned by the
//! caller until it is serialized onto the transport; every receiver decodes
//! an independent copy.
//!
//! Lineage is embedded by value: a child call carries a full copy of its
//! predecessor (which carries its own predecessor, and so on). Because the
//! chain is built from owned boxes it is finite and acyclic by construction.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::ClockSource;
use crate::definition::ServiceAddress;
use crate::result::ServiceCallResult;
use crate::topology;
use crate::types::DataObject;

/// Prefix of generated service call identifiers.
pub const SERVICE_CALL_ID_PREFIX: &str = "TSC-";
/// Prefix of generated transaction identifiers.
pub const TRANSACTION_ID_PREFIX: &str = "T-";

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

/// Where a call originated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallSource {
    pub instance_id: String,
    pub service_domain_name: String,
}

impl ServiceCallSource {
    #[must_use]
    pub fn new(service_domain_name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_domain_name: service_domain_name.into(),
        }
    }

    /// `"{domain}-{instance}"`, also the name of this instance's responses-in queue.
    #[must_use]
    pub fn hop_name(&self) -> String {
        topology::responses_in(&self.service_domain_name, &self.instance_id)
    }
}

/// Where a call is headed.
///
/// `instance_id` stays empty until a provider instance accepts and answers
/// the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCallDestination {
    pub service_domain_name: String,
    pub service_alias: String,
    pub service_version: i32,
    #[serde(default)]
    pub service_params: DataObject,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub instance_id: Option<String>,
}

impl ServiceCallDestination {
    #[must_use]
    pub fn new(address: &ServiceAddress, service_params: DataObject) -> Self {
        Self {
            service_domain_name: address.service_domain_name.clone(),
            service_alias: address.service_alias.clone(),
            service_version: address.service_version,
            service_params,
            instance_id: None,
        }
    }
}

// ---------------------------------------------------------------------------
// CorrelationKey
// ---------------------------------------------------------------------------

/// `"{serviceCallID}.{seq}"`: matches a response to its pending request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey(String);

impl CorrelationKey {
    #[must_use]
    pub fn new(service_call_id: &str, seq: u32) -> Self {
        Self(format!("{service_call_id}.{seq}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// ServiceCall
// ---------------------------------------------------------------------------

/// A single call traveling the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceCall {
    #[serde(rename = "serviceCallID")]
    service_call_id: String,
    #[serde(rename = "transactionID")]
    transaction_id: String,
    level: u32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    predecessor: Option<Box<ServiceCall>>,
    /// Calls triggered by this one. Populated opportunistically.
    #[serde(default)]
    pub successors: Vec<String>,
    last_task_seq: u32,
    pub source: ServiceCallSource,
    pub destination: ServiceCallDestination,
    pub created_on: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub finished_on: Option<u64>,
    pub is_completed: bool,
    pub is_successful: bool,
    /// Milliseconds between creation and completion.
    pub execution_time: u64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub result: Option<ServiceCallResult>,
}

impl ServiceCall {
    /// Creates the root call of a new transaction.
    #[must_use]
    pub fn root(
        source: ServiceCallSource,
        destination: ServiceCallDestination,
        clock: &dyn ClockSource,
    ) -> Self {
        let transaction_id = format!("{TRANSACTION_ID_PREFIX}{}", Uuid::new_v4());
        Self::create(transaction_id, 0, None, source, destination, clock)
    }

    /// Creates a call nested under `parent`: same transaction, one level deeper,
    /// with `parent` embedded by value as the predecessor.
    #[must_use]
    pub fn child(
        parent: &ServiceCall,
        source: ServiceCallSource,
        destination: ServiceCallDestination,
        clock: &dyn ClockSource,
    ) -> Self {
        Self::create(
            parent.transaction_id.clone(),
            parent.level + 1,
            Some(Box::new(parent.clone())),
            source,
            destination,
            clock,
        )
    }

    fn create(
        transaction_id: String,
        level: u32,
        predecessor: Option<Box<ServiceCall>>,
        source: ServiceCallSource,
        destination: ServiceCallDestination,
        clock: &dyn ClockSource,
    ) -> Self {
        Self {
            service_call_id: format!("{SERVICE_CALL_ID_PREFIX}{}", Uuid::new_v4()),
            transaction_id,
            level,
            predecessor,
            successors: Vec::new(),
            last_task_seq: 0,
            source,
            destination,
            created_on: clock.now(),
            finished_on: None,
            is_completed: false,
            is_successful: false,
            execution_time: 0,
            result: None,
        }
    }

    #[must_use]
    pub fn service_call_id(&self) -> &str {
        &self.service_call_id
    }

    #[must_use]
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.level
    }

    #[must_use]
    pub fn predecessor(&self) -> Option<&ServiceCall> {
        self.predecessor.as_deref()
    }

    /// `true` when this call is a downstream hop of another call.
    #[must_use]
    pub fn has_predecessor(&self) -> bool {
        self.predecessor.is_some()
    }

    #[must_use]
    pub fn last_task_seq(&self) -> u32 {
        self.last_task_seq
    }

    /// Walks the predecessor chain, nearest ancestor first.
    pub fn ancestors(&self) -> Ancestors<'_> {
        Ancestors {
            next: self.predecessor(),
        }
    }

    /// The root call of this lineage (`self` for a root call).
    #[must_use]
    pub fn lineage_root(&self) -> &ServiceCall {
        self.ancestors().last().unwrap_or(self)
    }

    /// Key of the currently outstanding hop.
    #[must_use]
    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::new(&self.service_call_id, self.last_task_seq)
    }

    /// Advances the task sequence for a new outbound hop and returns its key.
    pub fn begin_hop(&mut self) -> CorrelationKey {
        self.last_task_seq += 1;
        self.correlation_key()
    }

    /// Marks a returned call completed.
    ///
    /// Returns the key the hop was sent under, then steps the task sequence
    /// back by one, together with stamping completion.
    pub fn complete(&mut self, now: u64) -> CorrelationKey {
        let key = self.correlation_key();
        self.last_task_seq = self.last_task_seq.saturating_sub(1);
        self.finished_on = Some(now);
        self.is_completed = true;
        self.execution_time = now.saturating_sub(self.created_on);
        key
    }

    /// Stores the execution outcome on the call.
    ///
    /// The success flag mirrors the result: a result carrying a failure is
    /// never reported successful.
    pub fn capture_result(&mut self, mut result: ServiceCallResult) {
        if result.failure.is_some() {
            result.is_successful = false;
        }
        self.is_successful = result.is_successful;
        self.result = Some(result);
    }

    /// Queue the final response hop must reach: the source's responses-in.
    #[must_use]
    pub fn reply_queue(&self) -> String {
        self.source.hop_name()
    }

    pub fn record_successor(&mut self, service_call_id: impl Into<String>) {
        self.successors.push(service_call_id.into());
    }
}

impl fmt::Display for ServiceCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SERVICE CALL {{ {} > from: {} to: {}.{} }}",
            self.service_call_id,
            self.source.service_domain_name,
            self.destination.service_domain_name,
            self.destination.service_alias
        )?;
        if let Some(predecessor) = self.predecessor() {
            write!(f, "\n       ↳ {predecessor}")?;
        }
        Ok(())
    }
}

/// Iterator over a call's predecessor chain.
#[derive(Debug, Clone)]
pub struct Ancestors<'a> {
    next: Option<&'a ServiceCall>,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = &'a ServiceCall;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.predecessor();
        Some(current)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::clock::ManualClock;
    use crate::types::data_object;

    fn destination(domain: &str, alias: &str) -> ServiceCallDestination {
        ServiceCallDestination::new(&ServiceAddress::new(domain, alias, 1), DataObject::new())
    }

    fn source(domain: &str) -> ServiceCallSource {
        ServiceCallSource::new(domain, "INST-1")
    }

    #[test]
    fn root_call_starts_a_transaction() {
        let clock = ManualClock::new(10);
        let call = ServiceCall::root(source("X"), destination("Y", "a"), &clock);
        assert!(call.service_call_id().starts_with(SERVICE_CALL_ID_PREFIX));
        assert!(call.transaction_id().starts_with(TRANSACTION_ID_PREFIX));
        assert_eq!(call.level(), 0);
        assert!(!call.has_predecessor());
        assert_eq!(call.last_task_seq(), 0);
        assert_eq!(call.created_on, 10);
        assert!(call.destination.instance_id.is_none());
    }

    #[test]
    fn call_tree_a_b_c() {
        let clock = ManualClock::new(0);
        let a = ServiceCall::root(source("X"), destination("Y", "a"), &clock);
        let b = ServiceCall::child(&a, source("Y"), destination("Z", "b"), &clock);
        let c = ServiceCall::child(&b, source("Z"), destination("W", "c"), &clock);

        assert_eq!((a.level(), b.level(), c.level()), (0, 1, 2));
        assert_eq!(a.transaction_id(), b.transaction_id());
        assert_eq!(b.transaction_id(), c.transaction_id());

        let first = c.predecessor().expect("c has a predecessor");
        assert_eq!(first.service_call_id(), b.service_call_id());
        let second = first.predecessor().expect("b has a predecessor");
        assert_eq!(second.service_call_id(), a.service_call_id());
        assert!(second.predecessor().is_none());

        assert_eq!(c.ancestors().count(), 2);
        assert_eq!(c.lineage_root().service_call_id(), a.service_call_id());
    }

    #[test]
    fn begin_hop_then_complete_regenerates_key() {
        let clock = ManualClock::new(100);
        let mut call = ServiceCall::root(source("X"), destination("Y", "a"), &clock);
        let sent = call.begin_hop();
        assert_eq!(sent.as_str(), format!("{}.1", call.service_call_id()));

        let mut received = call.clone();
        let completed = received.complete(160);
        assert_eq!(completed, sent);
        assert_eq!(received.last_task_seq(), 0);
        assert!(received.is_completed);
        assert_eq!(received.finished_on, Some(160));
        assert_eq!(received.execution_time, 60);
    }

    #[test]
    fn capture_result_failure_is_never_successful() {
        let clock = ManualClock::new(0);
        let mut call = ServiceCall::root(source("X"), destination("Y", "a"), &clock);
        let mut result = ServiceCallResult::failed(crate::FailureKind::ExecutionFailed, "boom");
        result.is_successful = true;
        call.capture_result(result);
        assert!(!call.is_successful);
        assert!(!call.result.as_ref().unwrap().is_successful);
    }

    #[test]
    fn display_includes_predecessor_chain() {
        let clock = ManualClock::new(0);
        let a = ServiceCall::root(source("X"), destination("Y", "a"), &clock);
        let b = ServiceCall::child(&a, source("Y"), destination("Z", "b"), &clock);
        let rendered = b.to_string();
        assert!(rendered.starts_with(&format!(
            "SERVICE CALL {{ {} > from: Y to: Z.b }}",
            b.service_call_id()
        )));
        assert!(rendered.contains(&format!("↳ SERVICE CALL {{ {}", a.service_call_id())));
    }

    #[test]
    fn envelope_keeps_embedded_lineage() {
        let clock = ManualClock::new(0);
        let mut a = ServiceCall::root(source("X"), destination("Y", "a"), &clock);
        a.destination.service_params = data_object([("k", "v")]);
        let b = ServiceCall::child(&a, source("Y"), destination("Z", "b"), &clock);

        let bytes = rmp_serde::to_vec_named(&b).expect("serialize");
        let decoded: ServiceCall = rmp_serde::from_slice(&bytes).expect("deserialize");
        assert_eq!(decoded, b);
        assert_eq!(
            decoded.predecessor().unwrap().destination.service_params.get("k"),
            Some(&serde_json::Value::from("v"))
        );
    }

    proptest! {
        #[test]
        fn chain_levels_increase_by_one(depth in 0usize..12) {
            let clock = ManualClock::new(0);
            let mut call = ServiceCall::root(source("D0"), destination("D1", "s"), &clock);
            for i in 0..depth {
                let next = ServiceCall::child(
                    &call,
                    source(&format!("D{}", i + 1)),
                    destination(&format!("D{}", i + 2), "s"),
                    &clock,
                );
                call = next;
            }
            prop_assert_eq!(call.level() as usize, depth);
            prop_assert_eq!(call.ancestors().count(), depth);
            let mut expected = call.level();
            for ancestor in call.ancestors() {
                expected -= 1;
                prop_assert_eq!(ancestor.level(), expected);
                prop_assert_eq!(ancestor.transaction_id(), call.transaction_id());
            }
            prop_assert!(!call.lineage_root().has_predecessor());
        }

        #[test]
        fn hops_correlate_in_order(hops in 1u32..20) {
            let clock = ManualClock::new(0);
            let mut call = ServiceCall::root(source("X"), destination("Y", "s"), &clock);
            let mut keys = Vec::new();
            for _ in 0..hops {
                keys.push(call.begin_hop());
            }
            prop_assert_eq!(call.last_task_seq(), hops);
            let mut returned = call.clone();
            prop_assert_eq!(returned.complete(1), keys.last().cloned().unwrap());
            prop_assert_eq!(returned.last_task_seq(), hops - 1);
        }
    }
}
