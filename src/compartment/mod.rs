//! Network compartment switching for the threads of the hosting process
//!
//! A compartment is the routing context the network stack associates with a
//! thread. The calling thread is switched synchronously; every other thread
//! of the process receives an APC that performs the switch once it enters an
//! alertable wait.

pub mod broadcast;
pub mod pending;

#[cfg(windows)]
pub mod iphlp;
#[cfg(windows)]
pub mod threads;

use std::fmt;

use crate::Result;

pub use broadcast::{attach_process, broadcast_to_threads, AttachSummary, ThreadEntry, ThreadHost};
pub use pending::{ApcContext, PendingRequests, RequestId, RequestState, RequestStatus};

/// Routing compartment id assigned by the network stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompartmentId(pub u32);

impl CompartmentId {
    /// Reserved: no change requested
    pub const UNCHANGED: CompartmentId = CompartmentId(0);

    pub fn is_unchanged(self) -> bool {
        self == Self::UNCHANGED
    }
}

impl fmt::Display for CompartmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for CompartmentId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// Per-thread compartment functions exported by the networking stack
pub trait CompartmentApi: Send + Sync {
    /// `SetCurrentThreadCompartmentId`, returns a Win32 result code
    fn set_current_thread_compartment(&self, id: CompartmentId) -> u32;

    /// `GetCurrentThreadCompartmentId`, `None` when the export is missing
    fn current_thread_compartment(&self) -> Option<CompartmentId>;
}

/// Switch the calling thread and report the setter's result code verbatim.
///
/// The follow-up query only feeds the log; it never changes the result.
pub fn switch_current_thread(api: &dyn CompartmentApi, id: CompartmentId) -> u32 {
    let result = api.set_current_thread_compartment(id);
    if result == 0 {
        tracing::info!("SetCurrentThreadCompartmentId succeeded for id={}", id);
    } else {
        tracing::warn!("SetCurrentThreadCompartmentId FAILED id={} code={}", id, result);
    }

    match api.current_thread_compartment() {
        Some(current) => tracing::info!("GetCurrentThreadCompartmentId returned {}", current),
        None => tracing::info!("GetCurrentThreadCompartmentId symbol not found (cannot verify)"),
    }

    result
}

/// Body of the exported `SetTargetCompartmentId`.
///
/// `load` resolves the networking stack; when it fails its code is returned
/// and nothing else happens.
pub fn set_target_compartment<A, L>(id: CompartmentId, load: L) -> u32
where
    A: CompartmentApi,
    L: FnOnce() -> Result<A>,
{
    tracing::info!("SetTargetCompartmentId called with compartmentId={}", id);
    match load() {
        Ok(api) => switch_current_thread(&api, id),
        Err(e) => {
            tracing::warn!("{}", e);
            e.code()
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeCompartments;
    use super::*;

    #[test]
    fn test_switch_reflects_requested_id() {
        let api = FakeCompartments::new();
        for id in [2, 7, u32::MAX] {
            assert_eq!(switch_current_thread(&api, CompartmentId(id)), 0);
            assert_eq!(api.current_thread_compartment(), Some(CompartmentId(id)));
        }
    }

    #[test]
    fn test_failure_code_returned_verbatim() {
        let api = FakeCompartments::failing(5);
        assert_eq!(switch_current_thread(&api, CompartmentId(3)), 5);
        assert_eq!(api.current_thread_compartment(), Some(CompartmentId(1)));
    }

    #[test]
    fn test_missing_query_does_not_override_result() {
        let api = FakeCompartments::without_query();
        assert_eq!(switch_current_thread(&api, CompartmentId(4)), 0);
        assert_eq!(api.calls(), 1);
    }

    #[test]
    fn test_set_target_without_dependency() {
        let code = set_target_compartment(CompartmentId(3), || -> Result<FakeCompartments> {
            Err(crate::Error::ProcNotFound {
                library: "iphlpapi.dll",
                symbol: "SetCurrentThreadCompartmentId",
            })
        });
        assert_eq!(code, crate::error::ERROR_PROC_NOT_FOUND);
    }

    #[test]
    fn test_set_target_uses_loaded_api() {
        let code = set_target_compartment(CompartmentId(3), || Ok(FakeCompartments::failing(1168)));
        assert_eq!(code, 1168);
    }

    #[test]
    fn test_unchanged_id() {
        assert!(CompartmentId(0).is_unchanged());
        assert!(!CompartmentId::from(9).is_unchanged());
        assert_eq!(CompartmentId(9).to_string(), "9");
    }
}
