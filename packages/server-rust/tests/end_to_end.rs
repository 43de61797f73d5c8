//! Multi-microservice scenarios over the in-process broker.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshbus_core::codec::decode_call;
use meshbus_core::{
    data_object, DataObject, FailureKind, ServiceAddress, ServiceCall, ServiceCallResult,
    ServiceDefinition,
};
use meshbus_server::bus::{Dispatcher, InMemoryBroker, QueueConsumer, QueueOptions, Transport};
use meshbus_server::service::{
    BusConfig, Microservice, MicroserviceHost, Roles, ServiceCallContext, ServiceImplementation,
    StartContext,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Returns `{"testParam": "ok"}` after an optional delay.
struct Ok1 {
    delay: Duration,
}

#[async_trait]
impl ServiceImplementation for Ok1 {
    async fn execute(
        &self,
        _definition: &ServiceDefinition,
        _params: &DataObject,
        _ctx: &ServiceCallContext,
    ) -> anyhow::Result<ServiceCallResult> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(ServiceCallResult::success(data_object([("testParam", "ok")])))
    }
}

/// Reports the lineage of the call it serves.
struct Leaf;

#[async_trait]
impl ServiceImplementation for Leaf {
    async fn execute(
        &self,
        _definition: &ServiceDefinition,
        _params: &DataObject,
        ctx: &ServiceCallContext,
    ) -> anyhow::Result<ServiceCallResult> {
        let call = ctx
            .service_call()
            .ok_or_else(|| anyhow::anyhow!("leaf executed without a call"))?;
        let predecessor = call.predecessor().map(ServiceCall::service_call_id).unwrap_or_default();
        Ok(ServiceCallResult::success(data_object([
            ("level", serde_json::Value::from(call.level())),
            ("transactionId", call.transaction_id().into()),
            ("predecessorId", predecessor.into()),
        ])))
    }
}

/// Calls `leaf` in domain `C` and wraps its payload with its own lineage.
struct Relay;

#[async_trait]
impl ServiceImplementation for Relay {
    async fn execute(
        &self,
        _definition: &ServiceDefinition,
        params: &DataObject,
        ctx: &ServiceCallContext,
    ) -> anyhow::Result<ServiceCallResult> {
        let call = ctx
            .service_call()
            .ok_or_else(|| anyhow::anyhow!("relay executed without a call"))?;
        let nested = ctx.call(&ServiceAddress::new("C", "leaf", 1), params.clone()).await;
        if !nested.is_successful {
            return Ok(nested);
        }
        Ok(ServiceCallResult::success(data_object([
            ("level", serde_json::Value::from(call.level())),
            ("serviceCallId", call.service_call_id().into()),
            ("transactionId", call.transaction_id().into()),
            ("leaf", serde_json::Value::Object(nested.payload.unwrap_or_default())),
        ])))
    }
}

type Provision = fn(&StartContext);

struct TestMicroservice {
    roles: Roles,
    provision: Provision,
}

#[async_trait]
impl Microservice for TestMicroservice {
    fn name(&self) -> &str {
        if self.roles.is_provider() {
            "TestProvider"
        } else {
            "TestCaller"
        }
    }

    fn roles(&self) -> Roles {
        self.roles
    }

    async fn start(&self, ctx: &StartContext) -> anyhow::Result<()> {
        (self.provision)(ctx);
        Ok(())
    }
}

fn caller() -> Arc<dyn Microservice> {
    Arc::new(TestMicroservice {
        roles: Roles::CALLER,
        provision: |_| {},
    })
}

fn provider(provision: Provision) -> Arc<dyn Microservice> {
    Arc::new(TestMicroservice {
        roles: Roles::PROVIDER,
        provision,
    })
}

fn config(domain: &str) -> BusConfig {
    BusConfig {
        shutdown_grace_ms: 2_000,
        ..BusConfig::for_domain(domain)
    }
}

async fn call(host: &MicroserviceHost, address: &ServiceAddress, params: DataObject) -> ServiceCallResult {
    let caller = host.caller().expect("host has a caller");
    caller
        .call(address, params, &ServiceCallContext::root(Some(caller.clone())))
        .await
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn caller_gets_result_from_provider_domain() {
    let broker = Arc::new(InMemoryBroker::new());
    let y = MicroserviceHost::start(
        provider(|ctx| ctx.provide("service1", "Ok1", 1, || Ok1 { delay: Duration::ZERO })),
        config("Y"),
        broker.clone(),
    )
    .await
    .unwrap();
    let x = MicroserviceHost::start(caller(), config("X"), broker.clone()).await.unwrap();

    let result = call(&x, &ServiceAddress::new("Y", "service1", 1), DataObject::new()).await;
    assert!(result.is_successful);
    assert_eq!(result.payload_field("testParam"), Some(&"ok".into()));

    let latest = call(&x, &ServiceAddress::latest("Y", "service1"), DataObject::new()).await;
    assert!(latest.is_successful);

    let missing = call(&x, &ServiceAddress::new("Y", "service1", 7), DataObject::new()).await;
    let failure = missing.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::ServiceNotFound);
    assert_eq!(failure.hop.as_deref(), Some(y.dispatcher().identity().hop_name().as_str()));

    assert!(x.stop().await);
    assert!(y.stop().await);
    assert!(!broker.has_queue(&x.dispatcher().topology().responses_in));
}

#[tokio::test]
async fn nested_calls_share_transaction_and_deepen_level() {
    let broker = Arc::new(InMemoryBroker::new());
    let c = MicroserviceHost::start(provider(|ctx| ctx.provide("leaf", "Leaf", 1, || Leaf)), config("C"), broker.clone())
        .await
        .unwrap();
    let b = MicroserviceHost::start(provider(|ctx| ctx.provide("relay", "Relay", 1, || Relay)), config("B"), broker.clone())
        .await
        .unwrap();
    let a = MicroserviceHost::start(caller(), config("A"), broker.clone()).await.unwrap();

    let result = call(&a, &ServiceAddress::new("B", "relay", 1), DataObject::new()).await;
    assert!(result.is_successful, "{result:?}");

    let relay_level = result.payload_field("level").and_then(serde_json::Value::as_u64);
    let relay_tx = result.payload_field("transactionId").cloned();
    let relay_id = result.payload_field("serviceCallId").cloned();
    let leaf = result.payload_field("leaf").and_then(serde_json::Value::as_object).unwrap();

    assert_eq!(relay_level, Some(0));
    assert_eq!(leaf.get("level").and_then(serde_json::Value::as_u64), Some(1));
    assert_eq!(leaf.get("transactionId").cloned(), relay_tx);
    assert_eq!(leaf.get("predecessorId").cloned(), relay_id);

    assert!(a.stop().await);
    assert!(b.stop().await);
    assert!(c.stop().await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn over_capacity_requests_are_retried_until_served() {
    let broker = Arc::new(InMemoryBroker::new());
    let y = MicroserviceHost::start(
        provider(|ctx| ctx.provide("service1", "Ok1", 1, || Ok1 { delay: Duration::from_millis(20) })),
        BusConfig {
            service_call_capacity: 1,
            ..config("Y")
        },
        broker.clone(),
    )
    .await
    .unwrap();
    let x = MicroserviceHost::start(caller(), config("X"), broker.clone()).await.unwrap();

    let caller = x.caller().unwrap().clone();
    let ctx = ServiceCallContext::root(Some(caller.clone()));
    let address = ServiceAddress::new("Y", "service1", 1);
    let mut handles = Vec::new();
    for _ in 0..4 {
        handles.push(caller.call_async(&address, DataObject::new(), &ctx).await);
    }
    for handle in handles {
        let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
        assert!(result.is_successful, "{result:?}");
    }
    assert_eq!(y.dispatcher().admission().in_flight(), 0);

    assert!(x.stop().await);
    assert!(y.stop().await);
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let broker = Arc::new(InMemoryBroker::new());
    let x = MicroserviceHost::start(
        caller(),
        BusConfig {
            call_timeout_ms: 100,
            reaper_interval_ms: 20,
            ..config("X")
        },
        broker.clone(),
    )
    .await
    .unwrap();

    let result = call(&x, &ServiceAddress::new("Nobody", "service1", 1), DataObject::new()).await;
    assert!(!result.is_successful);
    assert_eq!(result.failure.unwrap().kind, FailureKind::Timeout);
    assert!(x.dispatcher().correlation().is_empty());
    assert_eq!(broker.queue_len("Nobody"), Some(1));

    assert!(x.stop().await);
}

#[tokio::test]
async fn duplicate_response_is_ignored() {
    let broker = InMemoryBroker::new();
    let dispatcher = Dispatcher::new(&config("X"), Arc::new(broker.clone()));

    let mut request = ServiceCall::root(
        dispatcher.identity().clone(),
        meshbus_core::ServiceCallDestination::new(&ServiceAddress::new("Y", "service1", 1), DataObject::new()),
        dispatcher.clock(),
    );
    let handle = dispatcher.send_request(&mut request).await.unwrap();

    let mut inbox = broker.consume("Y").await.unwrap();
    let delivery = inbox.next().await.unwrap();
    let mut response = decode_call(&delivery.envelope.body).unwrap();
    response.capture_result(ServiceCallResult::success(data_object([("n", 1)])));

    assert!(dispatcher.complete_service_call(response.clone()));
    assert!(!dispatcher.complete_service_call(response));

    let result = handle.await;
    assert_eq!(result.payload_field("n"), Some(&1.into()));
    assert!(dispatcher.correlation().is_empty());
    dispatcher.shutdown().await;
}

#[tokio::test]
async fn unacked_request_is_redelivered_after_recover() {
    let broker = Arc::new(InMemoryBroker::new());
    let x = MicroserviceHost::start(caller(), config("X"), broker.clone()).await.unwrap();

    let caller = x.caller().unwrap().clone();
    let handle = caller
        .call_async(
            &ServiceAddress::new("Y", "service1", 1),
            DataObject::new(),
            &ServiceCallContext::root(Some(caller.clone())),
        )
        .await;

    // An instance that takes the request and dies before acking it.
    broker.declare_queue("Y", QueueOptions::bus()).await.unwrap();
    let mut crashed = broker.consume("Y").await.unwrap();
    let taken = crashed.next().await.unwrap();
    assert!(!taken.redelivered);

    let y = MicroserviceHost::start(
        provider(|ctx| ctx.provide("service1", "Ok1", 1, || Ok1 { delay: Duration::ZERO })),
        config("Y"),
        broker.clone(),
    )
    .await
    .unwrap();
    drop(crashed);
    assert_eq!(broker.recover(), 1);

    let result = tokio::time::timeout(Duration::from_secs(5), handle).await.unwrap();
    assert!(result.is_successful, "{result:?}");

    assert!(x.stop().await);
    assert!(y.stop().await);
}

#[tokio::test]
async fn stopped_caller_abandons_pending_calls() {
    let broker = Arc::new(InMemoryBroker::new());
    let x = MicroserviceHost::start(
        caller(),
        BusConfig {
            call_timeout_ms: 0,
            ..config("X")
        },
        broker.clone(),
    )
    .await
    .unwrap();

    let caller = x.caller().unwrap().clone();
    let handle = caller
        .call_async(
            &ServiceAddress::new("Nobody", "service1", 1),
            DataObject::new(),
            &ServiceCallContext::root(Some(caller.clone())),
        )
        .await;
    assert!(x.stop().await);

    let result = handle.await;
    assert_eq!(result.failure.unwrap().kind, FailureKind::Abandoned);

    let after = call(&x, &ServiceAddress::new("Nobody", "service1", 1), DataObject::new()).await;
    assert_eq!(after.failure.unwrap().kind, FailureKind::DispatchFailed);
}
