//! Correlation of responses to pending calls.
//!
//! Every outbound hop registers a [`TaskCompletion`] under its correlation key
//! and hands the matching [`TaskHandle`] to the caller. The response receive
//! path, or the timeout reaper, removes the entry and resolves it exactly once.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use meshbus_core::{CorrelationKey, FailureKind, ServiceCallResult};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::warn;

use crate::service::worker::BackgroundRunnable;

// ---------------------------------------------------------------------------
// TaskCompletion / TaskHandle
// ---------------------------------------------------------------------------

/// Completion side of a pending call, owned by the correlation table.
#[derive(Debug)]
pub struct TaskCompletion {
    tx: Mutex<Option<oneshot::Sender<ServiceCallResult>>>,
    deadline: Option<Instant>,
}

impl TaskCompletion {
    /// Creates a linked completion/handle pair.
    #[must_use]
    pub fn pair(key: CorrelationKey, deadline: Option<Instant>) -> (Arc<Self>, TaskHandle) {
        let (tx, rx) = oneshot::channel();
        let completion = Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            deadline,
        });
        let handle = TaskHandle {
            key,
            state: HandleState::Pending(rx),
        };
        (completion, handle)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Resolves the handle. Returns `false` if it was already resolved.
    ///
    /// A handle the caller has dropped still counts as resolved.
    pub fn complete(&self, result: ServiceCallResult) -> bool {
        match self.tx.lock().take() {
            Some(tx) => {
                let _ = tx.send(result);
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.tx.lock().is_none()
    }
}

#[derive(Debug)]
enum HandleState {
    Pending(oneshot::Receiver<ServiceCallResult>),
    Ready(Option<ServiceCallResult>),
}

/// Pending result of a remote call.
///
/// Resolves with the correlated response's result, with a `Timeout` failure
/// when the deadline passes, or with an `Abandoned` failure if the
/// dispatcher drops the call without answering it.
#[derive(Debug)]
pub struct TaskHandle {
    key: CorrelationKey,
    state: HandleState,
}

impl TaskHandle {
    /// A handle that is already resolved, for failures before the call left
    /// the process.
    #[must_use]
    pub fn resolved(key: CorrelationKey, result: ServiceCallResult) -> Self {
        Self {
            key,
            state: HandleState::Ready(Some(result)),
        }
    }

    #[must_use]
    pub fn correlation_key(&self) -> &CorrelationKey {
        &self.key
    }
}

impl Future for TaskHandle {
    type Output = ServiceCallResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            HandleState::Pending(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(_)) => Poll::Ready(ServiceCallResult::failed(
                    FailureKind::Abandoned,
                    format!("call {} abandoned before a response arrived", this.key),
                )),
                Poll::Pending => Poll::Pending,
            },
            HandleState::Ready(slot) => Poll::Ready(slot.take().unwrap_or_else(|| {
                ServiceCallResult::failed(
                    FailureKind::Abandoned,
                    format!("call {} already yielded its result", this.key),
                )
            })),
        }
    }
}

// ---------------------------------------------------------------------------
// CorrelationTable
// ---------------------------------------------------------------------------

/// Correlation key to pending completion, behind one lock.
#[derive(Debug, Default)]
pub struct CorrelationTable {
    pending: Mutex<HashMap<CorrelationKey, Arc<TaskCompletion>>>,
}

impl CorrelationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a pending entry under `key` and returns its handle.
    pub fn register(&self, key: CorrelationKey, deadline: Option<Instant>) -> TaskHandle {
        let (completion, handle) = TaskCompletion::pair(key.clone(), deadline);
        self.add_task_handler(key, completion);
        handle
    }

    /// Inserts a completion, returning any entry it replaced.
    pub fn add_task_handler(
        &self,
        key: CorrelationKey,
        completion: Arc<TaskCompletion>,
    ) -> Option<Arc<TaskCompletion>> {
        self.pending.lock().insert(key, completion)
    }

    #[must_use]
    pub fn get_task_handler(&self, key: &CorrelationKey) -> Option<Arc<TaskCompletion>> {
        self.pending.lock().get(key).cloned()
    }

    pub fn remove_task_handler(&self, key: &CorrelationKey) -> Option<Arc<TaskCompletion>> {
        self.pending.lock().remove(key)
    }

    /// Removes and returns every entry whose deadline is at or before `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<(CorrelationKey, Arc<TaskCompletion>)> {
        let mut pending = self.pending.lock();
        let expired: Vec<CorrelationKey> = pending
            .iter()
            .filter(|(_, c)| c.deadline().is_some_and(|d| d <= now))
            .map(|(k, _)| k.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|k| pending.remove(&k).map(|c| (k, c)))
            .collect()
    }

    /// Drops every pending entry; their handles resolve as abandoned.
    pub fn abandon_all(&self) -> usize {
        let mut pending = self.pending.lock();
        let count = pending.len();
        pending.clear();
        count
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// ---------------------------------------------------------------------------
// PendingCallReaper
// ---------------------------------------------------------------------------

/// On-demand work for the reaper besides its periodic sweep.
#[derive(Debug)]
pub enum ReaperTask {
    /// Sweep immediately and report how many calls timed out.
    SweepNow(oneshot::Sender<usize>),
}

/// Background sweep resolving overdue pending calls with a timeout failure.
#[derive(Debug)]
pub struct PendingCallReaper {
    table: Arc<CorrelationTable>,
}

impl PendingCallReaper {
    #[must_use]
    pub fn new(table: Arc<CorrelationTable>) -> Self {
        Self { table }
    }

    fn sweep(&self) -> usize {
        let expired = self.table.take_expired(Instant::now());
        let count = expired.len();
        for (key, completion) in expired {
            warn!(
                target: "meshbus::esb",
                correlation_key = %key,
                "pending call timed out without a response"
            );
            metrics::counter!("meshbus_calls_timed_out_total").increment(1);
            completion.complete(ServiceCallResult::failed(
                FailureKind::Timeout,
                format!("no response for {key} before its deadline"),
            ));
        }
        count
    }
}

#[async_trait]
impl BackgroundRunnable for PendingCallReaper {
    type Task = ReaperTask;

    async fn run(&mut self, task: ReaperTask) {
        match task {
            ReaperTask::SweepNow(reply) => {
                let _ = reply.send(self.sweep());
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
