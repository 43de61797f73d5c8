//! Demo microservices exercising a two-hop call chain.
//!
//! `TestExecutor` (domain of its own choosing) periodically calls
//! `service1` in `testService1`. `TestProvider1` serves `service1` by relaying
//! to `service3` in `testService2`, which `TestProvider2` serves together with
//! the echoing `service2`.

use std::sync::Arc;

use async_trait::async_trait;
use meshbus_core::{data_object, DataObject, ServiceAddress, ServiceCallResult, ServiceDefinition};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::bootstrap::MicroserviceCatalog;
use crate::service::{
    BackgroundRunnable, BackgroundWorker, Microservice, Roles, ServiceCallContext, ServiceCaller,
    ServiceImplementation, StartContext,
};

pub const PROVIDER1_DOMAIN: &str = "testService1";
pub const PROVIDER2_DOMAIN: &str = "testService2";

/// Calls issued by the executor per round.
pub const CALLS_PER_ROUND: usize = 5;

/// Default pause between executor rounds.
pub const DEFAULT_ROUND_INTERVAL_MS: u64 = 10_000;

/// Catalog of the demo microservices, keyed by their names.
#[must_use]
pub fn catalog() -> MicroserviceCatalog {
    MicroserviceCatalog::new()
        .register("TestExecutor", TestExecutor::default)
        .register("TestProvider1", || TestProvider1)
        .register("TestProvider2", || TestProvider2)
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Tasks accepted by the executor's background loop.
#[derive(Debug)]
pub enum RoundTask {
    /// Runs one round immediately and reports its results.
    RunNow(oneshot::Sender<Vec<ServiceCallResult>>),
}

struct RoundRunner {
    caller: ServiceCaller,
}

impl RoundRunner {
    async fn run_round(&self) -> Vec<ServiceCallResult> {
        let address = ServiceAddress::new(PROVIDER1_DOMAIN, "service1", 1);
        let ctx = ServiceCallContext::root(Some(self.caller.clone()));

        let mut handles = Vec::with_capacity(CALLS_PER_ROUND);
        for round in 0..CALLS_PER_ROUND {
            let params = data_object([("round", round)]);
            handles.push(self.caller.call_async(&address, params, &ctx).await);
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            let result = handle.await;
            if result.is_successful {
                info!(target: "meshbus::esb", payload = ?result.payload, "demo call succeeded");
            } else {
                warn!(target: "meshbus::esb", failure = ?result.failure, "demo call failed");
            }
            results.push(result);
        }
        results
    }
}

#[async_trait]
impl BackgroundRunnable for RoundRunner {
    type Task = RoundTask;

    async fn run(&mut self, task: RoundTask) {
        match task {
            RoundTask::RunNow(reply) => {
                let _ = reply.send(self.run_round().await);
            }
        }
    }

    async fn on_tick(&mut self) {
        self.run_round().await;
    }
}

/// Caller-only microservice that calls `service1` in rounds.
pub struct TestExecutor {
    interval_ms: u64,
    worker: Mutex<Option<BackgroundWorker<RoundRunner>>>,
}

impl TestExecutor {
    #[must_use]
    pub fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            worker: Mutex::new(None),
        }
    }

    /// Runs one round outside the schedule. `None` before `start`.
    pub async fn run_round(&self) -> Option<Vec<ServiceCallResult>> {
        let (tx, rx) = oneshot::channel();
        {
            let guard = self.worker.lock();
            let worker = guard.as_ref()?;
            worker.try_submit(RoundTask::RunNow(tx)).ok()?;
        }
        rx.await.ok()
    }
}

impl Default for TestExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_ROUND_INTERVAL_MS)
    }
}

#[async_trait]
impl Microservice for TestExecutor {
    fn name(&self) -> &str {
        "TestExecutor"
    }

    fn roles(&self) -> Roles {
        Roles::CALLER
    }

    async fn start(&self, ctx: &StartContext) -> anyhow::Result<()> {
        let caller = ctx
            .caller()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("executor started without a caller"))?;
        let worker = BackgroundWorker::start(RoundRunner { caller }, self.interval_ms);
        *self.worker.lock() = Some(worker);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let worker = self.worker.lock().take();
        if let Some(mut worker) = worker {
            worker.stop().await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// Relays to `service3` in `testService2` and returns its result.
pub struct TestService1;

#[async_trait]
impl ServiceImplementation for TestService1 {
    async fn execute(
        &self,
        _definition: &ServiceDefinition,
        params: &DataObject,
        ctx: &ServiceCallContext,
    ) -> anyhow::Result<ServiceCallResult> {
        let address = ServiceAddress::new(PROVIDER2_DOMAIN, "service3", 1);
        Ok(ctx.call(&address, params.clone()).await)
    }
}

/// Echoes its parameters back as the payload.
pub struct TestService2;

#[async_trait]
impl ServiceImplementation for TestService2 {
    async fn execute(
        &self,
        _definition: &ServiceDefinition,
        params: &DataObject,
        _ctx: &ServiceCallContext,
    ) -> anyhow::Result<ServiceCallResult> {
        Ok(ServiceCallResult::success(params.clone()))
    }
}

/// Returns `{"testParam": "ok"}`.
pub struct TestService3;

#[async_trait]
impl ServiceImplementation for TestService3 {
    async fn execute(
        &self,
        _definition: &ServiceDefinition,
        _params: &DataObject,
        _ctx: &ServiceCallContext,
    ) -> anyhow::Result<ServiceCallResult> {
        Ok(ServiceCallResult::success(data_object([("testParam", "ok")])))
    }
}

pub struct TestProvider1;

#[async_trait]
impl Microservice for TestProvider1 {
    fn name(&self) -> &str {
        "TestProvider1"
    }

    fn roles(&self) -> Roles {
        Roles::PROVIDER
    }

    async fn start(&self, ctx: &StartContext) -> anyhow::Result<()> {
        ctx.provide("service1", "TestService1", 1, || TestService1);
        Ok(())
    }
}

pub struct TestProvider2;

#[async_trait]
impl Microservice for TestProvider2 {
    fn name(&self) -> &str {
        "TestProvider2"
    }

    fn roles(&self) -> Roles {
        Roles::PROVIDER
    }

    async fn start(&self, ctx: &StartContext) -> anyhow::Result<()> {
        ctx.provide("service2", "TestService2", 1, || TestService2);
        ctx.provide("service3", "TestService3", 1, || TestService3);
        Ok(())
    }
}
