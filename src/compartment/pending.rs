//! Registry of compartment-change requests handed to other threads
//!
//! A queued APC carries only a [`RequestId`]; the payload stays here until
//! exactly one path resolves it: the APC running on its thread, the
//! queue-failure path, or the detach sweep for APCs that never ran.

use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::{CompartmentApi, CompartmentId};

/// Value passed through the APC parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(pub usize);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Payload owned by one request
pub struct ApcContext {
    pub api: Arc<dyn CompartmentApi>,
    pub compartment: CompartmentId,
}

impl fmt::Debug for ApcContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApcContext")
            .field("compartment", &self.compartment)
            .finish_non_exhaustive()
    }
}

/// Lifecycle of a request still held by the registry. Resolved requests
/// (executed, released or abandoned) are removed, so the map only ever
/// holds in-flight work.
#[derive(Debug)]
pub enum RequestState {
    Queued(ApcContext),
    /// Payload taken by the target thread, setter in progress
    Running,
}

/// Payload-free view of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Queued,
    Running,
}

impl From<&RequestState> for RequestStatus {
    fn from(state: &RequestState) -> Self {
        match state {
            RequestState::Queued(_) => RequestStatus::Queued,
            RequestState::Running => RequestStatus::Running,
        }
    }
}

#[derive(Debug)]
struct PendingRequest {
    thread_id: u32,
    state: RequestState,
}

#[derive(Debug, Default)]
pub struct PendingRequests {
    next_id: AtomicUsize,
    executed: AtomicUsize,
    abandoned: AtomicUsize,
    requests: Mutex<HashMap<RequestId, PendingRequest>>,
}

static GLOBAL: OnceLock<PendingRequests> = OnceLock::new();

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry the Windows APC routine resolves its parameter against
    pub fn global() -> &'static PendingRequests {
        GLOBAL.get_or_init(PendingRequests::new)
    }

    /// Take ownership of `context` on behalf of `thread_id`. Ids start at 1.
    pub fn register(&self, thread_id: u32, context: ApcContext) -> RequestId {
        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.requests.lock().insert(
            id,
            PendingRequest {
                thread_id,
                state: RequestState::Queued(context),
            },
        );
        id
    }

    /// Queue-failure path: forget the request and hand the payload back
    pub fn release(&self, id: RequestId) -> Option<ApcContext> {
        let mut requests = self.requests.lock();
        let queued = requests
            .get(&id)
            .is_some_and(|r| matches!(r.state, RequestState::Queued(_)));
        if !queued {
            return None;
        }
        match requests.remove(&id)?.state {
            RequestState::Queued(context) => Some(context),
            RequestState::Running => None,
        }
    }

    /// Body of the APC: apply the carried change on `current_thread`.
    ///
    /// Returns the setter's result, or `None` when the request is unknown or
    /// was already resolved. The request is forgotten once the setter returns.
    pub fn execute(&self, id: RequestId, current_thread: u32) -> Option<u32> {
        let Some(context) = self.take_queued(id) else {
            tracing::debug!("[APC] Thread {} request {} no longer queued", current_thread, id);
            return None;
        };

        let result = context.api.set_current_thread_compartment(context.compartment);
        tracing::info!(
            "[APC] Thread {} SetCurrentThreadCompartmentId({}) => {}",
            current_thread,
            context.compartment,
            result
        );
        if let Some(current) = context.api.current_thread_compartment() {
            tracing::info!("[APC] Thread {} current compartment now {}", current_thread, current);
        }

        self.requests.lock().remove(&id);
        self.executed.fetch_add(1, Ordering::Relaxed);
        Some(result)
    }

    /// Drop the payload of every request whose APC has not run yet
    pub fn abandon_outstanding(&self) -> usize {
        let mut abandoned = 0;
        self.requests.lock().retain(|_, request| {
            if matches!(request.state, RequestState::Queued(_)) {
                tracing::debug!("[APC] abandoning request for thread {}", request.thread_id);
                abandoned += 1;
                return false;
            }
            true
        });
        self.abandoned.fetch_add(abandoned, Ordering::Relaxed);
        abandoned
    }

    /// `None` once the request has been resolved
    pub fn status(&self, id: RequestId) -> Option<RequestStatus> {
        self.requests.lock().get(&id).map(|r| RequestStatus::from(&r.state))
    }

    pub fn thread_of(&self, id: RequestId) -> Option<u32> {
        self.requests.lock().get(&id).map(|r| r.thread_id)
    }

    /// Requests whose APC has not run yet
    pub fn queued(&self) -> usize {
        self.requests
            .lock()
            .values()
            .filter(|r| matches!(r.state, RequestState::Queued(_)))
            .count()
    }

    /// Requests resolved by their APC
    pub fn executed(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Requests dropped by [`PendingRequests::abandon_outstanding`]
    pub fn abandoned(&self) -> usize {
        self.abandoned.load(Ordering::Relaxed)
    }

    /// In-flight requests
    pub fn len(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.lock().is_empty()
    }

    fn take_queued(&self, id: RequestId) -> Option<ApcContext> {
        let mut requests = self.requests.lock();
        let request = requests.get_mut(&id)?;
        if !matches!(request.state, RequestState::Queued(_)) {
            return None;
        }
        match mem::replace(&mut request.state, RequestState::Running) {
            RequestState::Queued(context) => Some(context),
            RequestState::Running => None,
        }
    }
}
