//! Toolhelp thread enumeration and APC delivery

use std::mem;
use std::sync::{Arc, OnceLock};

use windows::Win32::Foundation::{CloseHandle, GetLastError, HANDLE};
use windows::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD, THREADENTRY32,
};
use windows::Win32::System::Threading::{
    GetCurrentProcessId, GetCurrentThreadId, OpenThread, QueueUserAPC, THREAD_QUERY_INFORMATION,
    THREAD_SET_CONTEXT, THREAD_SUSPEND_RESUME,
};

use super::broadcast::{attach_process, AttachSummary, ThreadEntry, ThreadHost};
use super::iphlp::IpHelper;
use super::pending::{PendingRequests, RequestId};
use super::{CompartmentApi, CompartmentId};
use crate::error::win32_code;
use crate::{Error, Result};

/// Handle closed on drop
pub struct OwnedHandle(HANDLE);

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        unsafe {
            let _ = CloseHandle(self.0);
        }
    }
}

pub struct OpenedThread {
    handle: OwnedHandle,
    thread_id: u32,
}

/// The live process, with APCs resolved against [`PendingRequests::global`]
pub struct WindowsThreadHost;

impl ThreadHost for WindowsThreadHost {
    type Thread = OpenedThread;

    fn current_process_id(&self) -> u32 {
        unsafe { GetCurrentProcessId() }
    }

    fn current_thread_id(&self) -> u32 {
        unsafe { GetCurrentThreadId() }
    }

    fn snapshot_threads(&self) -> Result<Vec<ThreadEntry>> {
        unsafe {
            let snapshot = CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0)
                .map(OwnedHandle)
                .map_err(|e| Error::Snapshot(win32_code(&e)))?;

            let mut entry = THREADENTRY32 {
                dwSize: mem::size_of::<THREADENTRY32>() as u32,
                ..Default::default()
            };
            let mut threads = Vec::new();
            if Thread32First(snapshot.0, &mut entry).is_err() {
                return Ok(threads);
            }
            loop {
                threads.push(ThreadEntry {
                    thread_id: entry.th32ThreadID,
                    owner_process_id: entry.th32OwnerProcessID,
                });
                if Thread32Next(snapshot.0, &mut entry).is_err() {
                    break;
                }
            }
            Ok(threads)
        }
    }

    fn open_thread(&self, thread_id: u32) -> Result<OpenedThread> {
        unsafe {
            OpenThread(
                THREAD_SET_CONTEXT | THREAD_QUERY_INFORMATION | THREAD_SUSPEND_RESUME,
                false,
                thread_id,
            )
            .map(|handle| OpenedThread {
                handle: OwnedHandle(handle),
                thread_id,
            })
            .map_err(|e| Error::OpenThread {
                thread_id,
                code: win32_code(&e),
            })
        }
    }

    fn queue_apc(&self, thread: &OpenedThread, request: RequestId) -> Result<()> {
        unsafe {
            if QueueUserAPC(Some(compartment_apc), thread.handle.0, request.0) == 0 {
                return Err(Error::QueueApc {
                    thread_id: thread.thread_id,
                    code: GetLastError().0,
                });
            }
        }
        Ok(())
    }
}

/// Runs on the target thread inside an alertable wait
unsafe extern "system" fn compartment_apc(parameter: usize) {
    let thread_id = GetCurrentThreadId();
    let _ = std::panic::catch_unwind(move || {
        PendingRequests::global().execute(RequestId(parameter), thread_id);
    });
}

// Never dropped, so iphlpapi stays loaded while APCs may still reference it.
static ATTACH_API: OnceLock<Arc<dyn CompartmentApi>> = OnceLock::new();

/// `DLL_PROCESS_ATTACH` work: switch every thread of the process to `target`
pub fn attach_all_threads(target: Option<CompartmentId>) -> Option<AttachSummary> {
    attach_process(&WindowsThreadHost, PendingRequests::global(), target, || {
        if let Some(api) = ATTACH_API.get() {
            return Ok(api.clone());
        }
        let api: Arc<dyn CompartmentApi> = Arc::new(IpHelper::load()?);
        Ok(ATTACH_API.get_or_init(|| api).clone())
    })
}

/// `DLL_PROCESS_DETACH` work: drop the payload of every APC that never ran
pub fn abandon_pending() -> usize {
    let abandoned = PendingRequests::global().abandon_outstanding();
    if abandoned > 0 {
        tracing::info!("[APC] {} queued requests never ran; released", abandoned);
    }
    abandoned
}
