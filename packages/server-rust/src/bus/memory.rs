//! In-process message broker implementing [`Transport`].
//!
//! Queues are FIFO `VecDeque`s keyed by name in a `DashMap`; consumers park on
//! a per-queue `Notify`. Deliveries stay in an unacked table until acked, so
//! [`InMemoryBroker::recover`] can redeliver them the way a real broker does
//! after a consumer crash.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::debug;

use super::transport::{
    Delivery, DeliveryTag, Envelope, QueueConsumer, QueueOptions, Transport, TransportError,
};

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Ready {
    envelope: Envelope,
    redelivered: bool,
}

#[derive(Debug)]
struct Unacked {
    queue: String,
    envelope: Envelope,
}

#[derive(Debug)]
struct QueueState {
    name: String,
    options: QueueOptions,
    ready: Mutex<VecDeque<Ready>>,
    notify: Notify,
    consumers: AtomicUsize,
    deleted: AtomicBool,
}

impl QueueState {
    fn new(name: &str, options: QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
            ready: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            consumers: AtomicUsize::new(0),
            deleted: AtomicBool::new(false),
        }
    }

    fn push_back(&self, item: Ready) {
        self.ready.lock().push_back(item);
        self.notify.notify_one();
    }

    fn push_front(&self, item: Ready) {
        self.ready.lock().push_front(item);
        self.notify.notify_one();
    }
}

#[derive(Debug)]
struct BrokerInner {
    queues: DashMap<String, Arc<QueueState>>,
    unacked: DashMap<DeliveryTag, Unacked>,
    next_tag: AtomicU64,
    closed: AtomicBool,
}

impl BrokerInner {
    fn queue_or_declare(&self, name: &str) -> Arc<QueueState> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(name, QueueOptions::bus())))
            .value()
            .clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// InMemoryBroker
// ---------------------------------------------------------------------------

/// Cheaply cloneable handle to one in-process broker.
#[derive(Debug, Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl InMemoryBroker {
    /// Creates an empty broker. Delivery tags start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                queues: DashMap::new(),
                unacked: DashMap::new(),
                next_tag: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Returns `true` if the queue currently exists.
    #[must_use]
    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.queues.contains_key(queue)
    }

    /// Number of ready (not yet delivered) messages, if the queue exists.
    #[must_use]
    pub fn queue_len(&self, queue: &str) -> Option<usize> {
        self.inner.queues.get(queue).map(|q| q.ready.lock().len())
    }

    /// Number of live consumers on a queue.
    #[must_use]
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.load(Ordering::Acquire))
    }

    /// Number of delivered-but-unacked messages across all queues.
    #[must_use]
    pub fn unacked_count(&self) -> usize {
        self.inner.unacked.len()
    }

    /// Puts every unacked delivery back at the head of its queue, flagged as
    /// redelivered, in original delivery order.
    ///
    /// Returns the number of messages requeued.
    pub fn recover(&self) -> usize {
        let mut tags: Vec<DeliveryTag> = self.inner.unacked.iter().map(|e| *e.key()).collect();
        // Requeue newest first at the head so the oldest ends up in front.
        tags.sort_unstable_by(|a, b| b.cmp(a));

        let mut requeued = 0;
        for tag in tags {
            if let Some((_, unacked)) = self.inner.unacked.remove(&tag) {
                if let Some(queue) = self.inner.queues.get(&unacked.queue) {
                    queue.push_front(Ready {
                        envelope: unacked.envelope,
                        redelivered: true,
                    });
                    requeued += 1;
                }
            }
        }
        requeued
    }

    /// Closes the broker: every consumer stream ends and further operations fail.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        for queue in &self.inner.queues {
            queue.notify.notify_waiters();
        }
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for InMemoryBroker {
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError> {
        if self.inner.is_closed() {
            return Err(TransportError::Closed);
        }
        let existing = self
            .inner
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(queue, options)))
            .value()
            .clone();
        if existing.options == options {
            Ok(())
        } else {
            Err(TransportError::OptionsMismatch {
                queue: queue.to_string(),
            })
        }
    }

    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError> {
        if self.inner.is_closed() {
            return Err(TransportError::Closed);
        }
        self.inner.queue_or_declare(queue).push_back(Ready {
            envelope,
            redelivered: false,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, TransportError> {
        if self.inner.is_closed() {
            return Err(TransportError::Closed);
        }
        let state = self
            .inner
            .queues
            .get(queue)
            .map(|q| q.value().clone())
            .ok_or_else(|| TransportError::QueueNotFound(queue.to_string()))?;
        state.consumers.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(InMemoryConsumer {
            broker: Arc::clone(&self.inner),
            state,
        }))
    }

    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError> {
        self.inner
            .unacked
            .remove(&tag)
            .map(|_| ())
            .ok_or(TransportError::UnknownDelivery(tag))
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError> {
        let (_, unacked) = self
            .inner
            .unacked
            .remove(&tag)
            .ok_or(TransportError::UnknownDelivery(tag))?;
        if requeue {
            // A requeue into a queue that was deleted meanwhile drops the message.
            if let Some(queue) = self.inner.queues.get(&unacked.queue) {
                queue.push_front(Ready {
                    envelope: unacked.envelope,
                    redelivered: true,
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryConsumer
// ---------------------------------------------------------------------------

/// One subscription on an in-memory queue.
///
/// Dropping the last consumer of an `auto_delete` queue deletes the queue
/// together with any ready messages.
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: Arc<BrokerInner>,
    state: Arc<QueueState>,
}

#[async_trait]
impl QueueConsumer for InMemoryConsumer {
    async fn next(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a push or close between
            // the check and the await still wakes us.
            notified.as_mut().enable();

            if self.broker.is_closed() || self.state.deleted.load(Ordering::Acquire) {
                return None;
            }

            let next = self.state.ready.lock().pop_front();
            if let Some(ready) = next {
                let tag = DeliveryTag(self.broker.next_tag.fetch_add(1, Ordering::Relaxed));
                self.broker.unacked.insert(
                    tag,
                    Unacked {
                        queue: self.state.name.clone(),
                        envelope: ready.envelope.clone(),
                    },
                );
                return Some(Delivery {
                    tag,
                    queue: self.state.name.clone(),
                    envelope: ready.envelope,
                    redelivered: ready.redelivered,
                });
            }

            notified.await;
        }
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        let previous = self.state.consumers.fetch_sub(1, Ordering::AcqRel);
        if previous == 1 && self.state.options.auto_delete {
            let removed = self
                .broker
                .queues
                .remove_if(&self.state.name, |_, q| Arc::ptr_eq(q, &self.state));
            if removed.is_some() {
                self.state.deleted.store(true, Ordering::Release);
                self.state.notify.notify_waiters();
                debug!(target: "meshbus::esb", queue = %self.state.name, "auto-deleted unused queue");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
