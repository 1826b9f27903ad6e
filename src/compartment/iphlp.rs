//! Dynamically resolved iphlpapi compartment functions

use std::mem;

use windows::core::{s, w};
use windows::Win32::Foundation::{FreeLibrary, HMODULE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};

use super::{CompartmentApi, CompartmentId};
use crate::error::win32_code;
use crate::{Error, Result};

pub const IPHLPAPI: &str = "iphlpapi.dll";
const SET_SYMBOL: &str = "SetCurrentThreadCompartmentId";

type SetCompartmentFn = unsafe extern "system" fn(u32) -> u32;
type GetCompartmentFn = unsafe extern "system" fn() -> u32;

/// Loaded `iphlpapi.dll`, released on drop
pub struct IpHelper {
    module: HMODULE,
    set: SetCompartmentFn,
    get: Option<GetCompartmentFn>,
}

// The module handle and function pointers are process-global and usable from any thread.
unsafe impl Send for IpHelper {}
unsafe impl Sync for IpHelper {}

impl IpHelper {
    /// Load the library and resolve the setter; the getter is optional
    pub fn load() -> Result<Self> {
        unsafe {
            let module = LoadLibraryW(w!("iphlpapi.dll")).map_err(|e| Error::LibraryLoad {
                library: IPHLPAPI,
                code: win32_code(&e),
            })?;

            let Some(set) = GetProcAddress(module, s!("SetCurrentThreadCompartmentId")) else {
                let _ = FreeLibrary(module);
                return Err(Error::ProcNotFound {
                    library: IPHLPAPI,
                    symbol: SET_SYMBOL,
                });
            };
            let get = GetProcAddress(module, s!("GetCurrentThreadCompartmentId"));

            Ok(Self {
                module,
                set: mem::transmute::<unsafe extern "system" fn() -> isize, SetCompartmentFn>(set),
                get: get.map(|f| {
                    mem::transmute::<unsafe extern "system" fn() -> isize, GetCompartmentFn>(f)
                }),
            })
        }
    }
}

impl CompartmentApi for IpHelper {
    fn set_current_thread_compartment(&self, id: CompartmentId) -> u32 {
        unsafe { (self.set)(id.0) }
    }

    fn current_thread_compartment(&self) -> Option<CompartmentId> {
        self.get.map(|get| CompartmentId(unsafe { get() }))
    }
}

impl Drop for IpHelper {
    fn drop(&mut self) {
        unsafe {
            let _ = FreeLibrary(self.module);
        }
    }
}
