//! VFP route rule DLL
//!
//! Exports `VfpAddRule`, which adds a PA route rewrite to a switch port
//! through `vfpapi.dll`. Negative results are local failures, see
//! [`ReturnCode`]; positive results are VFP statuses.

#![cfg(windows)]

use std::panic;

use k2s_winhelpers::vfp::ffi::VfpApi;
use k2s_winhelpers::vfp::{return_code, ReturnCode, RouteRule};
use k2s_winhelpers::{Error, Result};
use windows::core::PCWSTR;

fn wide_arg(value: PCWSTR, what: &str) -> Result<String> {
    if value.is_null() {
        return Err(Error::InvalidArgument(format!("{what} is null")));
    }
    unsafe { value.to_string() }
        .map_err(|_| Error::InvalidArgument(format!("{what} is not valid UTF-16")))
}

/// # Safety
///
/// Every string argument must be null or a NUL-terminated UTF-16 string.
#[no_mangle]
pub unsafe extern "C" fn VfpAddRule(
    name: PCWSTR,
    switch_name: PCWSTR,
    port_name: PCWSTR,
    subnet: PCWSTR,
    gateway_mac: PCWSTR,
    priority: u16,
) -> i32 {
    let result = panic::catch_unwind(|| -> Result<()> {
        let rule = RouteRule::parse(
            &wide_arg(name, "name")?,
            &wide_arg(switch_name, "switch name")?,
            &wide_arg(port_name, "port name")?,
            &wide_arg(subnet, "subnet")?,
            &wide_arg(gateway_mac, "gateway MAC")?,
            priority,
        )?;
        VfpApi::load()?.add_rule(&rule)
    });

    match result {
        Ok(Ok(())) => ReturnCode::Success as i32,
        Ok(Err(e)) => return_code(&e),
        Err(_) => ReturnCode::InvalidArgument as i32,
    }
}
