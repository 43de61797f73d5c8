//! The per-process authority for bus traffic.
//!
//! The dispatcher owns the queue topology of its instance, the admission
//! counter, and the correlation table. It runs one consumer loop per queue the
//! instance listens on and hands every delivery to a short-lived unit of work,
//! acknowledging the delivery only after that work finishes.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use meshbus_core::codec::{decode_call, encode_call, DecodeError, EncodeError};
use meshbus_core::{
    topology, CallFailure, ClockSource, FailureKind, QueueTopology, ServiceCall,
    ServiceCallResult, ServiceCallSource, SystemClock, DYNAMIC_DESTINATION_HEADER,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::admission::{AdmissionControl, AdmissionPermit};
use super::correlation::{CorrelationTable, PendingCallReaper, TaskHandle};
use super::shutdown::{HealthState, ShutdownController};
use super::transport::{Delivery, Envelope, QueueConsumer, QueueOptions, Transport, TransportError};
use crate::service::config::BusConfig;
use crate::service::worker::BackgroundWorker;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Local failures of the dispatcher. Never sent across a hop.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("failed to encode service call: {0}")]
    Encode(#[from] EncodeError),
    #[error("failed to decode service call: {0}")]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("message carries no dynamic-destination header")]
    MissingRoute,
    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

impl DispatchError {
    /// Failure description for a caller whose call could not be sent.
    #[must_use]
    pub fn to_failure(&self) -> CallFailure {
        CallFailure::new(FailureKind::DispatchFailed, self.to_string())
    }
}

// ---------------------------------------------------------------------------
// InboundHandler
// ---------------------------------------------------------------------------

/// Provider-side processing of one decoded request.
///
/// `envelope` is the message as delivered, so a rejected request can be
/// re-enqueued unchanged.
#[async_trait]
pub trait InboundHandler: Send + Sync + 'static {
    async fn handle_request(&self, call: ServiceCall, envelope: Envelope);
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Bus dispatcher of one instance. Shared as `Arc<Dispatcher>`.
pub struct Dispatcher {
    identity: ServiceCallSource,
    topology: QueueTopology,
    transport: Arc<dyn Transport>,
    admission: AdmissionControl,
    correlation: Arc<CorrelationTable>,
    shutdown: ShutdownController,
    clock: Arc<dyn ClockSource>,
    call_timeout: Option<Duration>,
    shutdown_grace: Duration,
    loops: Mutex<Vec<JoinHandle<()>>>,
    reaper: Mutex<Option<BackgroundWorker<PendingCallReaper>>>,
}

impl Dispatcher {
    /// Creates the dispatcher for the instance described by `config`.
    ///
    /// Must be called from within a Tokio runtime: the timeout reaper is
    /// started here when call timeouts are enabled.
    #[must_use]
    pub fn new(config: &BusConfig, transport: Arc<dyn Transport>) -> Arc<Self> {
        Self::with_clock(config, transport, Arc::new(SystemClock))
    }

    /// Like [`Dispatcher::new`] with an explicit clock for call timestamps.
    #[must_use]
    pub fn with_clock(
        config: &BusConfig,
        transport: Arc<dyn Transport>,
        clock: Arc<dyn ClockSource>,
    ) -> Arc<Self> {
        let correlation = Arc::new(CorrelationTable::new());
        let call_timeout = config.call_timeout();
        let reaper = call_timeout.map(|_| {
            BackgroundWorker::start(
                PendingCallReaper::new(Arc::clone(&correlation)),
                config.reaper_interval_ms.max(1),
            )
        });

        Arc::new(Self {
            identity: ServiceCallSource::new(&config.service_domain_name, &config.instance_id),
            topology: QueueTopology::for_instance(&config.service_domain_name, &config.instance_id),
            transport,
            admission: AdmissionControl::new(config.service_call_capacity),
            correlation,
            shutdown: ShutdownController::new(),
            clock,
            call_timeout,
            shutdown_grace: config.shutdown_grace(),
            loops: Mutex::new(Vec::new()),
            reaper: Mutex::new(reaper),
        })
    }

    /// Source stamped on every call this instance originates.
    #[must_use]
    pub fn identity(&self) -> &ServiceCallSource {
        &self.identity
    }

    #[must_use]
    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    #[must_use]
    pub fn clock(&self) -> &dyn ClockSource {
        self.clock.as_ref()
    }

    #[must_use]
    pub fn admission(&self) -> &AdmissionControl {
        &self.admission
    }

    #[must_use]
    pub fn correlation(&self) -> &CorrelationTable {
        &self.correlation
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        self.shutdown.health_state()
    }

    // -----------------------------------------------------------------------
    // Send path
    // -----------------------------------------------------------------------

    /// Sends `call` to its destination domain and returns the pending handle.
    ///
    /// Advances the call's task sequence, registers the handle under the
    /// resulting correlation key, then enqueues the call on the destination's
    /// requests-in queue. The handle is registered before publishing so a
    /// fast response can never miss it; a failed publish removes it again.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatcher is shutting down, the call cannot
    /// be encoded, or the transport rejects the publish. No handle stays
    /// registered in that case.
    pub async fn send_request(&self, call: &mut ServiceCall) -> Result<TaskHandle, DispatchError> {
        if self.shutdown.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }

        let key = call.begin_hop();
        let body = encode_call(call)?;
        let queue = topology::requests_in(&call.destination.service_domain_name);
        let deadline = self.call_timeout.map(|t| Instant::now() + t);
        let handle = self.correlation.register(key.clone(), deadline);

        if let Err(err) = self.transport.publish(&queue, Envelope::new(body)).await {
            self.correlation.remove_task_handler(&key);
            return Err(err.into());
        }

        debug!(
            target: "meshbus::trace",
            transaction_id = call.transaction_id(),
            service_call_id = call.service_call_id(),
            correlation_key = %key,
            queue = %queue,
            "request sent"
        );
        Ok(handle)
    }

    // -----------------------------------------------------------------------
    // Receive path
    // -----------------------------------------------------------------------

    /// Completes a returned call and resolves the handle waiting for it.
    ///
    /// Returns `false` when no handle is pending under the call's key
    /// (already resolved, timed out, or a duplicate delivery); the response
    /// is logged and dropped.
    pub fn complete_service_call(&self, mut call: ServiceCall) -> bool {
        let key = call.complete(self.clock.now());

        let Some(completion) = self.correlation.remove_task_handler(&key) else {
            error!(
                target: "meshbus::esb",
                transaction_id = call.transaction_id(),
                service_call_id = call.service_call_id(),
                correlation_key = %key,
                "no pending handler for response, dropping it"
            );
            metrics::counter!("meshbus_correlation_anomalies_total").increment(1);
            return false;
        };

        let result = call.result.take().unwrap_or_else(|| {
            ServiceCallResult::failed(
                FailureKind::MalformedResponse,
                format!("response for {key} carried no result"),
            )
        });
        debug!(
            target: "meshbus::trace",
            transaction_id = call.transaction_id(),
            service_call_id = call.service_call_id(),
            correlation_key = %key,
            successful = result.is_successful,
            execution_time_ms = call.execution_time,
            "response received"
        );
        metrics::counter!("meshbus_responses_completed_total").increment(1);
        completion.complete(result);
        true
    }

    // -----------------------------------------------------------------------
    // Provider side
    // -----------------------------------------------------------------------

    /// Applies admission control to an inbound request.
    #[must_use]
    pub fn admit(&self, call: &ServiceCall) -> Option<AdmissionPermit> {
        self.admission.try_admit(call)
    }

    /// Re-enqueues a rejected request, unchanged, on its destination domain's
    /// requests-in queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport rejects the publish.
    pub async fn reject_request(
        &self,
        envelope: &Envelope,
        call: &ServiceCall,
    ) -> Result<(), DispatchError> {
        let target = topology::requests_in(&call.destination.service_domain_name);
        warn!(
            target: "meshbus::esb",
            service_call_id = call.service_call_id(),
            load = self.admission.in_flight(),
            capacity = self.admission.capacity(),
            queue = %target,
            "request rejected at capacity, re-enqueued"
        );
        let rerouted = envelope.clone().with_header(DYNAMIC_DESTINATION_HEADER, target);
        self.route_dynamic(rerouted).await
    }

    /// Stamps this instance on the answered call and stages it on the own
    /// responses-out queue, then releases the admission slot.
    ///
    /// The slot is released whether or not the enqueue succeeded.
    ///
    /// # Errors
    ///
    /// Returns an error if the call cannot be encoded or published.
    pub async fn send_service_response(
        &self,
        mut call: ServiceCall,
        permit: AdmissionPermit,
    ) -> Result<(), DispatchError> {
        call.destination.instance_id = Some(self.identity.instance_id.clone());

        let outcome = match encode_call(&call) {
            Ok(body) => self
                .transport
                .publish(&self.topology.responses_out, Envelope::new(body))
                .await
                .map_err(DispatchError::from),
            Err(err) => Err(err.into()),
        };

        let load = permit.release();
        debug!(
            target: "meshbus::trace",
            transaction_id = call.transaction_id(),
            service_call_id = call.service_call_id(),
            successful = call.is_successful,
            load,
            "response staged"
        );
        outcome
    }

    /// Forwards a message to the queue named by its dynamic-destination
    /// header, with every transport header stripped.
    ///
    /// # Errors
    ///
    /// Returns an error if the header is missing or the publish fails.
    pub async fn route_dynamic(&self, envelope: Envelope) -> Result<(), DispatchError> {
        let Envelope { mut headers, body } = envelope;
        let target = headers
            .remove(DYNAMIC_DESTINATION_HEADER)
            .ok_or(DispatchError::MissingRoute)?;
        self.transport.publish(&target, Envelope::new(body)).await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Consumer configuration
    // -----------------------------------------------------------------------

    /// Starts draining this instance's responses-in queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be declared or consumed.
    pub async fn configure_service_consumer(self: &Arc<Self>) -> Result<(), DispatchError> {
        let queue = self.topology.responses_in.clone();
        let consumer = self.subscribe(&queue).await?;
        self.spawn_loop(queue, consumer, |dispatcher, delivery| async move {
            dispatcher.on_response(&delivery);
        });
        self.shutdown.set_ready();
        Ok(())
    }

    /// Starts draining this domain's requests-in queue into `handler`, plus
    /// the bounce route from the own responses-out queue to each caller.
    ///
    /// # Errors
    ///
    /// Returns an error if either queue cannot be declared or consumed.
    pub async fn configure_service_provider(
        self: &Arc<Self>,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<(), DispatchError> {
        let completed = self.topology.responses_out.clone();
        let bounce = self.subscribe(&completed).await?;
        self.spawn_loop(completed, bounce, |dispatcher, delivery| async move {
            dispatcher.on_completed(delivery).await;
        });

        let requests = self.topology.requests_in.clone();
        let consumer = self.subscribe(&requests).await?;
        self.spawn_loop(requests, consumer, move |dispatcher, delivery| {
            let handler = Arc::clone(&handler);
            async move {
                dispatcher.on_request(handler.as_ref(), delivery).await;
            }
        });
        self.shutdown.set_ready();
        Ok(())
    }

    async fn subscribe(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, DispatchError> {
        self.transport.declare_queue(queue, QueueOptions::bus()).await?;
        let consumer = self.transport.consume(queue).await?;
        info!(target: "meshbus::esb", queue, "consuming");
        Ok(consumer)
    }

    fn spawn_loop<F, Fut>(self: &Arc<Self>, queue: String, mut consumer: Box<dyn QueueConsumer>, work: F)
    where
        F: Fn(Arc<Self>, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let dispatcher = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.shutdown_receiver();

        let handle = tokio::spawn(async move {
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }
                tokio::select! {
                    delivery = consumer.next() => {
                        let Some(delivery) = delivery else {
                            debug!(target: "meshbus::esb", queue = %queue, "consumer stream ended");
                            break;
                        };
                        let guard = dispatcher.shutdown.in_flight_guard();
                        let tag = delivery.tag;
                        let unit = work(Arc::clone(&dispatcher), delivery);
                        let transport = Arc::clone(&dispatcher.transport);
                        tokio::spawn(async move {
                            unit.await;
                            if let Err(err) = transport.ack(tag).await {
                                warn!(target: "meshbus::esb", ?tag, %err, "ack failed");
                            }
                            drop(guard);
                        });
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
            drop(consumer);
            debug!(target: "meshbus::esb", queue = %queue, "consumer loop stopped");
        });

        self.loops.lock().push(handle);
    }

    fn on_response(&self, delivery: &Delivery) {
        match decode_call(&delivery.envelope.body) {
            Ok(call) => {
                self.complete_service_call(call);
            }
            Err(err) => {
                error!(target: "meshbus::esb", queue = %delivery.queue, %err, "undecodable response dropped");
                metrics::counter!("meshbus_correlation_anomalies_total").increment(1);
            }
        }
    }

    async fn on_completed(&self, delivery: Delivery) {
        let call = match decode_call(&delivery.envelope.body) {
            Ok(call) => call,
            Err(err) => {
                error!(target: "meshbus::esb", queue = %delivery.queue, %err, "undecodable response dropped");
                return;
            }
        };
        let envelope = delivery
            .envelope
            .with_header(DYNAMIC_DESTINATION_HEADER, call.reply_queue());
        if let Err(err) = self.route_dynamic(envelope).await {
            error!(
                target: "meshbus::esb",
                service_call_id = call.service_call_id(),
                reply_queue = %call.reply_queue(),
                %err,
                "failed to forward response to caller"
            );
        }
    }

    async fn on_request(&self, handler: &dyn InboundHandler, delivery: Delivery) {
        match decode_call(&delivery.envelope.body) {
            Ok(call) => handler.handle_request(call, delivery.envelope).await,
            Err(err) => {
                error!(target: "meshbus::esb", queue = %delivery.queue, %err, "undecodable request dropped");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Stops the consumer loops and the reaper, waits for in-flight work up to
    /// the configured grace period, and abandons every pending handle.
    ///
    /// Returns `true` if in-flight work drained within the grace period.
    pub async fn shutdown(&self) -> bool {
        info!(target: "meshbus::esb", instance_id = %self.identity.instance_id, "dispatcher shutting down");
        self.shutdown.trigger_shutdown();

        let reaper = self.reaper.lock().take();
        if let Some(mut reaper) = reaper {
            reaper.stop().await;
        }

        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *self.loops.lock());
        for handle in loops {
            let _ = handle.await;
        }

        let drained = self.shutdown.wait_for_drain(self.shutdown_grace).await;
        if !drained {
            warn!(
                target: "meshbus::esb",
                in_flight = self.shutdown.in_flight_count(),
                "shutdown grace period expired with work in flight"
            );
        }

        let abandoned = self.correlation.abandon_all();
        if abandoned > 0 {
            info!(target: "meshbus::esb", abandoned, "pending calls abandoned");
        }
        drained
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("identity", &self.identity)
            .field("topology", &self.topology)
            .field("admission", &self.admission)
            .field("pending", &self.correlation.len())
            .field("state", &self.shutdown.health_state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use meshbus_core::{
        data_object, DataObject, ManualClock, ServiceAddress, ServiceCallDestination,
    };

    use super::*;
    use crate::bus::memory::InMemoryBroker;

    fn make_config(domain: &str, instance: &str) -> BusConfig {
        BusConfig {
            service_domain_name: domain.to_string(),
            instance_id: instance.to_string(),
            shutdown_grace_ms: 500,
            ..BusConfig::default()
        }
    }

    fn make_dispatcher(broker: &InMemoryBroker, domain: &str, instance: &str) -> Arc<Dispatcher> {
        Dispatcher::with_clock(
            &make_config(domain, instance),
            Arc::new(broker.clone()),
            Arc::new(ManualClock::new(1_000)),
        )
    }

    fn make_call(dispatcher: &Dispatcher, domain: &str) -> ServiceCall {
        ServiceCall::root(
            dispatcher.identity().clone(),
            ServiceCallDestination::new(&ServiceAddress::new(domain, "service1", 1), DataObject::new()),
            dispatcher.clock(),
        )
    }

    #[tokio::test]
    async fn send_registers_then_publishes() {
        let broker = InMemoryBroker::new();
        let dispatcher = make_dispatcher(&broker, "X", "1");
        let mut call = make_call(&dispatcher, "Y");

        let handle = dispatcher.send_request(&mut call).await.unwrap();
        assert_eq!(call.last_task_seq(), 1);
        assert_eq!(handle.correlation_key(), &call.correlation_key());
        assert!(dispatcher.correlation().get_task_handler(&call.correlation_key()).is_some());
        assert_eq!(broker.queue_len("Y"), Some(1));
    }

    #[tokio::test]
    async fn failed_publish_leaves_no_handle() {
        let broker = InMemoryBroker::new();
        let dispatcher = make_dispatcher(&broker, "X", "1");
        let mut call = make_call(&dispatcher, "Y");
        broker.close();

        let err = dispatcher.send_request(&mut call).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(TransportError::Closed)));
        assert!(dispatcher.correlation().is_empty());
        assert_eq!(err.to_failure().kind, FailureKind::DispatchFailed);
    }

    #[tokio::test]
    async fn completion_resolves_exactly_once() {
        let broker = InMemoryBroker::new();
        let dispatcher = make_dispatcher(&broker, "X", "1");
        let mut call = make_call(&dispatcher, "Y");
        let handle = dispatcher.send_request(&mut call).await.unwrap();

        let mut answered = call.clone();
        answered.capture_result(ServiceCallResult::success(data_object([("testParam", "ok")])));

        assert!(dispatcher.complete_service_call(answered.clone()));
        assert!(!dispatcher.complete_service_call(answered));

        let result = handle.await;
        assert!(result.is_successful);
        assert_eq!(result.payload_field("testParam"), Some(&"ok".into()));
    }

    #[tokio::test]
    async fn response_without_result_is_malformed() {
        let broker = InMemoryBroker::new();
        let dispatcher = make_dispatcher(&broker, "X", "1");
        let mut call = make_call(&dispatcher, "Y");
        let handle = dispatcher.send_request(&mut call).await.unwrap();

        assert!(dispatcher.complete_service_call(call));
        assert_eq!(handle.await.failure.unwrap().kind, FailureKind::MalformedResponse);
    }

    #[tokio::test]
    async fn reject_requeues_without_headers() {
        let broker = InMemoryBroker::new();
        let dispatcher = make_dispatcher(&broker, "Y", "1");
        let call = make_call(&dispatcher, "Y");
        let envelope = Envelope::new(encode_call(&call).unwrap());

        dispatcher.reject_request(&envelope, &call).await.unwrap();

        broker.declare_queue("Y", QueueOptions::bus()).await.unwrap();
        let mut consumer = broker.consume("Y").await.unwrap();
        let delivery = consumer.next().await.unwrap();
        assert_eq!(delivery.envelope.body, envelope.body);
        assert!(delivery.envelope.headers.is_empty());
    }

    #[tokio::test]
    async fn route_dynamic_requires_header() {
        let broker = InMemoryBroker::new();
        let dispatcher = make_dispatcher(&broker, "Y", "1");
        let err = dispatcher.route_dynamic(Envelope::new(vec![1])).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingRoute));
    }

    #[tokio::test]
    async fn response_is_bounced_to_caller_inbox() {
        let broker = InMemoryBroker::new();
        let caller = make_dispatcher(&broker, "X", "1");
        let provider = make_dispatcher(&broker, "Y", "2");

        struct Never;
        #[async_trait]
        impl InboundHandler for Never {
            async fn handle_request(&self, _call: ServiceCall, _envelope: Envelope) {}
        }
        provider.configure_service_provider(Arc::new(Never)).await.unwrap();
        caller.configure_service_consumer().await.unwrap();

        let mut call = make_call(&caller, "Y");
        let handle = caller.send_request(&mut call).await.unwrap();

        let permit = provider.admit(&call).unwrap();
        call.capture_result(ServiceCallResult::empty());
        provider.send_service_response(call, permit).await.unwrap();
        assert_eq!(provider.admission().in_flight(), 0);

        let result = tokio::time::timeout(Duration::from_secs(2), handle).await.unwrap();
        assert!(result.is_successful);

        provider.shutdown().await;
        caller.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_abandons_pending_and_removes_queues() {
        let broker = InMemoryBroker::new();
        let dispatcher = make_dispatcher(&broker, "X", "1");
        dispatcher.configure_service_consumer().await.unwrap();
        assert_eq!(dispatcher.health_state(), HealthState::Ready);
        assert!(broker.has_queue("X-1"));

        let mut call = make_call(&dispatcher, "Y");
        let handle = dispatcher.send_request(&mut call).await.unwrap();

        assert!(dispatcher.shutdown().await);
        assert_eq!(dispatcher.health_state(), HealthState::Stopped);
        assert!(!broker.has_queue("X-1"));
        assert_eq!(handle.await.failure.unwrap().kind, FailureKind::Abandoned);

        let mut late = make_call(&dispatcher, "Y");
        assert!(matches!(
            dispatcher.send_request(&mut late).await,
            Err(DispatchError::ShuttingDown)
        ));
    }
}
