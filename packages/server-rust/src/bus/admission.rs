//! Per-instance admission control for inbound requests.
//!
//! A single counter tracks requests accepted for local execution. A request
//! is admitted when capacity is unlimited (`0`), the counter is below
//! capacity, or the request is a downstream hop of an already admitted call.
//! The last rule keeps a saturated instance from deadlocking a call chain
//! that routes back through itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meshbus_core::ServiceCall;

/// Shared in-flight counter and capacity of one instance.
#[derive(Debug, Clone)]
pub struct AdmissionControl {
    in_flight: Arc<AtomicU64>,
    capacity: u64,
}

impl AdmissionControl {
    /// `capacity == 0` means unlimited.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            in_flight: Arc::new(AtomicU64::new(0)),
            capacity,
        }
    }

    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Applies the admission policy to `call`.
    ///
    /// On success the counter is incremented and a permit is returned that
    /// decrements it again when dropped. Returns `None` when the call must be
    /// rejected.
    #[must_use]
    pub fn try_admit(&self, call: &ServiceCall) -> Option<AdmissionPermit> {
        let exempt = self.capacity == 0 || call.has_predecessor();
        let capacity = self.capacity;
        let admitted = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (exempt || current < capacity).then_some(current + 1)
            });

        match admitted {
            Ok(previous) => {
                metrics::counter!("meshbus_requests_admitted_total").increment(1);
                #[allow(clippy::cast_precision_loss)]
                metrics::gauge!("meshbus_requests_in_flight").set((previous + 1) as f64);
                Some(AdmissionPermit {
                    control: self.clone(),
                    released: false,
                })
            }
            Err(_) => {
                metrics::counter!("meshbus_requests_rejected_total").increment(1);
                None
            }
        }
    }

    /// Decrements the in-flight counter, clamping at zero.
    ///
    /// Returns the counter value after the decrement.
    pub fn release(&self) -> u64 {
        let previous = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(1))
            })
            .unwrap_or(0);
        let now = previous.saturating_sub(1);
        #[allow(clippy::cast_precision_loss)]
        metrics::gauge!("meshbus_requests_in_flight").set(now as f64);
        now
    }
}

/// Proof that a request was admitted. Dropping it releases the slot.
///
/// The slot is released on every exit path, including a failed response
/// enqueue or a panic while executing.
#[derive(Debug)]
pub struct AdmissionPermit {
    control: AdmissionControl,
    released: bool,
}

impl AdmissionPermit {
    /// Releases the slot now. Returns the counter value afterwards.
    pub fn release(mut self) -> u64 {
        self.released = true;
        self.control.release()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if !self.released {
            self.control.release();
        }
    }
}
