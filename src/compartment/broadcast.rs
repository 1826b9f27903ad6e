//! Attach-time switch of every thread in the process

use std::sync::Arc;

use super::pending::{ApcContext, PendingRequests, RequestId};
use super::{CompartmentApi, CompartmentId};
use crate::{Error, Result};

/// One row of a process-wide thread snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadEntry {
    pub thread_id: u32,
    pub owner_process_id: u32,
}

/// Thread enumeration and APC delivery of the operating system
#[cfg_attr(test, mockall::automock(type Thread = u32;))]
pub trait ThreadHost {
    /// Open thread handle, closed when dropped
    type Thread;

    fn current_process_id(&self) -> u32;

    fn current_thread_id(&self) -> u32;

    /// Every thread of every process at the moment of the call
    fn snapshot_threads(&self) -> Result<Vec<ThreadEntry>>;

    /// Open with rights to queue an APC and suspend/resume
    fn open_thread(&self, thread_id: u32) -> Result<Self::Thread>;

    /// Queue the compartment APC carrying `request`
    fn queue_apc(&self, thread: &Self::Thread, request: RequestId) -> Result<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachSummary {
    /// Result of the synchronous switch of the attaching thread
    pub direct: Option<u32>,
    pub queued: usize,
    /// Threads that could not be opened
    pub skipped: usize,
    /// Threads opened but whose APC could not be queued
    pub failed: usize,
}

/// Switch the calling thread directly and queue an APC to every other
/// thread owned by the current process.
///
/// Delivery is best effort: a queued APC only runs once its thread enters an
/// alertable wait, and nothing waits for that to happen.
pub fn broadcast_to_threads<H: ThreadHost>(
    host: &H,
    pending: &PendingRequests,
    api: Arc<dyn CompartmentApi>,
    id: CompartmentId,
) -> Result<AttachSummary> {
    let entries = host.snapshot_threads().inspect_err(|e| {
        tracing::warn!("Thread snapshot failed err={}", e.code());
    })?;

    let process_id = host.current_process_id();
    let attaching_thread = host.current_thread_id();
    let mut summary = AttachSummary::default();

    for entry in entries.iter().filter(|e| e.owner_process_id == process_id) {
        if entry.thread_id == attaching_thread {
            let result = api.set_current_thread_compartment(id);
            tracing::info!(
                "[Direct] Attach thread {} SetCurrentThreadCompartmentId({}) => {}",
                entry.thread_id,
                id,
                result
            );
            summary.direct = Some(result);
            continue;
        }

        let thread = match host.open_thread(entry.thread_id) {
            Ok(thread) => thread,
            Err(e) => {
                tracing::debug!("[APC] {}", e);
                summary.skipped += 1;
                continue;
            }
        };

        let request = pending.register(
            entry.thread_id,
            ApcContext {
                api: api.clone(),
                compartment: id,
            },
        );
        match host.queue_apc(&thread, request) {
            Ok(()) => summary.queued += 1,
            Err(e) => {
                drop(pending.release(request));
                tracing::warn!("[APC] QueueUserAPC failed thread={} err={}", entry.thread_id, e.code());
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        "APC queue summary: queued={} skipped={} (threads must enter alertable wait to run APCs)",
        summary.queued,
        summary.skipped
    );
    Ok(summary)
}

/// Load-time entry: resolve the setter and broadcast, never failing the load.
///
/// `target` of `None` means nothing was requested, in which case `load` is
/// not even called.
pub fn attach_process<H, L>(
    host: &H,
    pending: &PendingRequests,
    target: Option<CompartmentId>,
    load: L,
) -> Option<AttachSummary>
where
    H: ThreadHost,
    L: FnOnce() -> Result<Arc<dyn CompartmentApi>>,
{
    let Some(id) = target.filter(|id| !id.is_unchanged()) else {
        tracing::info!("[Attach] No COMPARTMENT_ID_ATTACH set; skipping automatic per-thread switch.");
        return None;
    };

    let api = match load() {
        Ok(api) => api,
        Err(e @ Error::ProcNotFound { .. }) => {
            tracing::warn!("[Attach] SetCurrentThreadCompartmentId export missing ({})", e);
            return None;
        }
        Err(e) => {
            tracing::warn!("[Attach] {}", e);
            return None;
        }
    };

    tracing::info!(
        "[Attach] Queuing compartment switch to {} for all process threads via APC",
        id
    );
    broadcast_to_threads(host, pending, api, id).ok()
}
