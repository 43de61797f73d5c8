//! Transport port: the durable message-queue contract the dispatcher relies on.
//!
//! Implementations must provide at-least-once delivery, FIFO order per queue,
//! competing consumers on shared queues, and manual acknowledgment.

use std::collections::BTreeMap;

use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Queue options
// ---------------------------------------------------------------------------

/// Properties requested when declaring a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    /// Delete the queue once its last consumer goes away.
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Options every bus queue is declared with: durable, non-exclusive,
    /// auto-delete-when-unused.
    #[must_use]
    pub fn bus() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: true,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::bus()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// A message as published: transport headers plus an opaque body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Envelope {
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Envelope {
    #[must_use]
    pub fn new(body: Vec<u8>) -> Self {
        Self {
            headers: BTreeMap::new(),
            body,
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// Transport-assigned identifier of one delivery, used to ack or nack it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(pub u64);

/// A message handed to a consumer. Must be acked or nacked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub queue: String,
    pub envelope: Envelope,
    /// `true` when this message was delivered before and never acked.
    pub redelivered: bool,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised by a transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is closed")]
    Closed,
    #[error("queue not found: {0}")]
    QueueNotFound(String),
    #[error("unknown delivery tag: {0:?}")]
    UnknownDelivery(DeliveryTag),
    #[error("queue {queue} already declared with different options")]
    OptionsMismatch { queue: String },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Pull side of a queue subscription.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Waits for the next delivery. Returns `None` once the subscription ends
    /// (queue deleted or transport closed).
    async fn next(&mut self) -> Option<Delivery>;
}

/// Durable queue transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Declares a queue; declaring an existing queue with equal options is a no-op.
    async fn declare_queue(&self, queue: &str, options: QueueOptions) -> Result<(), TransportError>;

    /// Publishes to a queue, declaring it with [`QueueOptions::bus`] if absent.
    async fn publish(&self, queue: &str, envelope: Envelope) -> Result<(), TransportError>;

    /// Subscribes to a queue as one of possibly many competing consumers.
    async fn consume(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, TransportError>;

    /// Confirms a delivery was processed; it will not be redelivered.
    async fn ack(&self, tag: DeliveryTag) -> Result<(), TransportError>;

    /// Rejects a delivery, optionally putting it back on its queue.
    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bus_queue_options() {
        let opts = QueueOptions::default();
        assert!(opts.durable);
        assert!(!opts.exclusive);
        assert!(opts.auto_delete);
    }

    #[test]
    fn envelope_headers() {
        let env = Envelope::new(vec![1, 2]).with_header("dynamic-destination", "Y");
        assert_eq!(env.header("dynamic-destination"), Some("Y"));
        assert_eq!(env.header("other"), None);
        assert_eq!(env.body, vec![1, 2]);
    }
}
