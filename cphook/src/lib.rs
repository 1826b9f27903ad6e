//! Compartment hook DLL
//!
//! Once loaded into a process it switches every thread to the compartment
//! named by `COMPARTMENT_ID_ATTACH`, and exports `SetTargetCompartmentId`
//! for callers that want to switch a single thread through
//! `CreateRemoteThread`.

#![cfg(windows)]

use std::ffi::c_void;
use std::panic;

use k2s_winhelpers::compartment::iphlp::IpHelper;
use k2s_winhelpers::compartment::threads::{abandon_pending, attach_all_threads};
use k2s_winhelpers::compartment::{set_target_compartment, CompartmentId};
use k2s_winhelpers::error::ERROR_INVALID_PARAMETER;
use k2s_winhelpers::{HookConfig, ProcessLog};
use windows::Win32::Foundation::{BOOL, HINSTANCE, HMODULE, TRUE};
use windows::Win32::System::LibraryLoader::DisableThreadLibraryCalls;
use windows::Win32::System::SystemServices::{DLL_PROCESS_ATTACH, DLL_PROCESS_DETACH};

#[no_mangle]
extern "system" fn DllMain(module: HINSTANCE, reason: u32, _reserved: *mut c_void) -> BOOL {
    match reason {
        DLL_PROCESS_ATTACH => {
            unsafe {
                let _ = DisableThreadLibraryCalls(HMODULE(module.0));
            }
            let _ = panic::catch_unwind(|| {
                let config = HookConfig::from_env();
                ProcessLog::init(&config);
                tracing::info!("DLL_PROCESS_ATTACH");
                attach_all_threads(config.attach_compartment);
            });
        }
        DLL_PROCESS_DETACH => {
            let _ = panic::catch_unwind(|| {
                abandon_pending();
                tracing::info!("DLL_PROCESS_DETACH closing log.");
                if let Some(log) = ProcessLog::get() {
                    log.close();
                }
            });
        }
        _ => {}
    }
    TRUE
}

/// Thread routine: the compartment id travels in the pointer-sized parameter.
#[no_mangle]
pub extern "system" fn SetTargetCompartmentId(parameter: *mut c_void) -> u32 {
    panic::catch_unwind(|| {
        ProcessLog::init(&HookConfig::from_env());
        let id = CompartmentId(parameter as usize as u32);
        set_target_compartment(id, IpHelper::load)
    })
    .unwrap_or(ERROR_INVALID_PARAMETER)
}
