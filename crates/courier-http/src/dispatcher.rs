//! In-flight call tracking and tag-based cancellation.
//!
//! Every call started through a [`Client`](crate::Client) is registered here
//! while it is queued or running and removed once it reaches a terminal
//! state. Registration, the queued to running transition, removal, and bulk
//! cancellation all happen under one lock, so a bulk cancel never misses a
//! call that is changing state.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{HttpError, Result};
use crate::request::Tag;
use crate::response::Response;

/// Identifier of a tracked call, unique per dispatcher.
pub type CallId = u64;

/// Lifecycle of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Queued,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

/// Point-in-time view of a tracked call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    pub id: CallId,
    pub tag: Option<Tag>,
    pub state: CallState,
}

/// State shared between the registry, the running task and the caller's handle.
#[derive(Debug)]
pub(crate) struct CallCell {
    state: Mutex<CallState>,
    cancelled: AtomicBool,
    notify: Notify,
}

impl CallCell {
    fn new(state: CallState) -> Self {
        Self {
            state: Mutex::new(state),
            cancelled: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub(crate) fn state(&self) -> CallState {
        *self.state.lock()
    }

    /// Request cancellation. Terminal calls are left alone.
    fn cancel(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        let first = !self.cancelled.swap(true, Ordering::AcqRel);
        self.notify.notify_waiters();
        first
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Resolves once cancellation has been requested.
    pub(crate) async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct Entry {
    tag: Option<Tag>,
    cell: Arc<CallCell>,
}

/// Registry of queued and running calls for one client.
pub struct Dispatcher {
    calls: Mutex<HashMap<CallId, Entry>>,
    next_id: AtomicU64,
    permits: Arc<Semaphore>,
    max_requests: usize,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("max_requests", &self.max_requests)
            .field("tracked", &self.calls.lock().len())
            .finish()
    }
}

impl Dispatcher {
    /// Create a dispatcher running at most `max_requests` queued calls at once.
    pub fn new(max_requests: usize) -> Self {
        let max_requests = max_requests.max(1);
        Self {
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            permits: Arc::new(Semaphore::new(max_requests)),
            max_requests,
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Track a new call and return the guard that untracks it.
    pub(crate) fn register(self: &Arc<Self>, tag: Option<Tag>, state: CallState) -> CallGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cell = Arc::new(CallCell::new(state));

        self.calls.lock().insert(
            id,
            Entry {
                tag: tag.clone(),
                cell: Arc::clone(&cell),
            },
        );
        tracing::trace!(call = id, tag = ?tag, state = ?state, "call registered");

        CallGuard {
            dispatcher: Arc::clone(self),
            id,
            tag,
            cell,
            finished: false,
        }
    }

    /// Wait for a running slot.
    pub(crate) async fn acquire(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| HttpError::Cancelled)
    }

    /// Move a queued call to running, unless it was cancelled meanwhile.
    fn promote(&self, id: CallId) -> bool {
        let calls = self.calls.lock();
        match calls.get(&id) {
            Some(entry) if !entry.cell.is_cancelled() => {
                *entry.cell.state.lock() = CallState::Running;
                true
            }
            _ => false,
        }
    }

    fn untrack(&self, id: CallId, outcome: CallState) {
        let mut calls = self.calls.lock();
        if let Some(entry) = calls.remove(&id) {
            *entry.cell.state.lock() = outcome;
        }
    }

    /// Cancel every queued and running call. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    /// Cancel the calls whose tag equals `tag`.
    ///
    /// `None` cancels everything, the same as [`Dispatcher::cancel_all`].
    pub fn cancel_tagged(&self, tag: Option<&Tag>) -> usize {
        match tag {
            None => self.cancel_all(),
            Some(tag) => self.cancel_where(|entry| entry.tag.as_ref() == Some(tag)),
        }
    }

    /// Cancel a single call by id.
    pub fn cancel(&self, id: CallId) -> bool {
        let calls = self.calls.lock();
        calls.get(&id).map(|entry| entry.cell.cancel()).unwrap_or(false)
    }

    fn cancel_where(&self, matches: impl Fn(&Entry) -> bool) -> usize {
        let calls = self.calls.lock();
        let cancelled = calls
            .iter()
            .filter(|(_, entry)| matches(*entry))
            .filter(|(id, entry)| {
                let newly = entry.cell.cancel();
                if newly {
                    tracing::debug!(call = **id, tag = ?entry.tag, "call cancelled");
                }
                newly
            })
            .count();
        cancelled
    }

    /// State of a tracked call, `None` once it has left the registry.
    pub fn state(&self, id: CallId) -> Option<CallState> {
        self.calls.lock().get(&id).map(|entry| entry.cell.state())
    }

    pub fn queued_calls(&self) -> Vec<CallInfo> {
        self.snapshot(CallState::Queued)
    }

    pub fn running_calls(&self) -> Vec<CallInfo> {
        self.snapshot(CallState::Running)
    }

    pub fn queued_count(&self) -> usize {
        self.count(CallState::Queued)
    }

    pub fn running_count(&self) -> usize {
        self.count(CallState::Running)
    }

    fn count(&self, state: CallState) -> usize {
        self.calls
            .lock()
            .values()
            .filter(|entry| entry.cell.state() == state)
            .count()
    }

    fn snapshot(&self, state: CallState) -> Vec<CallInfo> {
        let calls = self.calls.lock();
        let mut infos: Vec<CallInfo> = calls
            .iter()
            .filter(|(_, entry)| entry.cell.state() == state)
            .map(|(id, entry)| CallInfo {
                id: *id,
                tag: entry.tag.clone(),
                state,
            })
            .collect();
        infos.sort_by_key(|info| info.id);
        infos
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Keeps a call registered until it finishes or is dropped.
///
/// Dropping an unfinished guard (for example when the caller drops the
/// future) records the call as cancelled.
pub(crate) struct CallGuard {
    dispatcher: Arc<Dispatcher>,
    id: CallId,
    tag: Option<Tag>,
    cell: Arc<CallCell>,
    finished: bool,
}

impl CallGuard {
    pub(crate) fn id(&self) -> CallId {
        self.id
    }

    pub(crate) fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    pub(crate) fn cell(&self) -> Arc<CallCell> {
        Arc::clone(&self.cell)
    }

    /// The caller-side handle for this call, minus its task.
    pub(crate) fn ticket(&self) -> Ticket {
        Ticket {
            id: self.id,
            tag: self.tag.clone(),
            cell: Arc::clone(&self.cell),
            dispatcher: Arc::clone(&self.dispatcher),
        }
    }

    /// Move from queued to running; fails if cancelled while waiting.
    pub(crate) fn promote(&self) -> Result<()> {
        if self.dispatcher.promote(self.id) {
            tracing::trace!(call = self.id, "call running");
            Ok(())
        } else {
            Err(HttpError::Cancelled)
        }
    }

    /// Record the outcome and leave the registry.
    pub(crate) fn finish<T>(mut self, result: &Result<T>) {
        let outcome = match result {
            Ok(_) => CallState::Completed,
            Err(HttpError::Cancelled) => CallState::Cancelled,
            Err(_) => CallState::Failed,
        };
        self.dispatcher.untrack(self.id, outcome);
        self.finished = true;
        tracing::trace!(call = self.id, outcome = ?outcome, "call finished");
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.dispatcher.untrack(self.id, CallState::Cancelled);
        }
    }
}

/// Handle to a call running in the background.
pub struct InFlightCall {
    id: CallId,
    tag: Option<Tag>,
    cell: Arc<CallCell>,
    dispatcher: Arc<Dispatcher>,
    handle: JoinHandle<Result<Response>>,
}

impl std::fmt::Debug for InFlightCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightCall")
            .field("id", &self.id)
            .field("tag", &self.tag)
            .field("state", &self.state())
            .finish()
    }
}

/// Everything an [`InFlightCall`] needs except the task running it.
pub(crate) struct Ticket {
    id: CallId,
    tag: Option<Tag>,
    cell: Arc<CallCell>,
    dispatcher: Arc<Dispatcher>,
}

impl Ticket {
    pub(crate) fn attach(self, handle: JoinHandle<Result<Response>>) -> InFlightCall {
        InFlightCall {
            id: self.id,
            tag: self.tag,
            cell: self.cell,
            dispatcher: self.dispatcher,
            handle,
        }
    }
}

impl InFlightCall {
    pub fn id(&self) -> CallId {
        self.id
    }

    pub fn tag(&self) -> Option<&Tag> {
        self.tag.as_ref()
    }

    pub fn state(&self) -> CallState {
        self.cell.state()
    }

    /// Request cancellation. A call that already finished is unaffected.
    pub fn cancel(&self) -> bool {
        self.dispatcher.cancel(self.id)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the response headers.
    pub async fn wait(self) -> Result<Response> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(_) => Err(HttpError::Cancelled),
        }
    }
}
