//! `vfpapi.dll` descriptors and the add-rule call sequence

use std::ffi::c_void;
use std::{mem, ptr};

use windows::core::{s, GUID, HSTRING, PCWSTR};
use windows::Win32::Foundation::{FreeLibrary, HANDLE, HMODULE};
use windows::Win32::System::LibraryLoader::{
    GetProcAddress, LoadLibraryExW, LOAD_LIBRARY_SEARCH_SYSTEM32,
};

use super::schema::{rule_data, VfxItemType, FILTER_ID_GUID, VFX_ITEM_MAX};
use super::{RouteRule, ADD_OBJECT_SYMBOL, DEFAULT_DEVICE, INITIALIZE_DESCRIPTOR_SYMBOL, VFPAPI};
use crate::error::win32_code;
use crate::{Error, Result};

const MAX_CONDITIONS: usize = 5;
const MAX_RULE_DATA: usize = 2;

/// `VFC_PARAMETERS`: which switch port the object is added to
#[repr(C)]
pub struct SwitchPort {
    pub device_name: PCWSTR,
    pub extension_guid: *const GUID,
    pub field1: *mut c_void,
    pub switch_name: PCWSTR,
    pub port_name: PCWSTR,
    pub reserved: *mut c_void,
}

/// `VFC_OBJECT_ID`: path of names indexed by [`VfxItemType`]
#[repr(C)]
pub struct ObjectId {
    pub count: u32,
    pub ids: [PCWSTR; VFX_ITEM_MAX],
}

#[repr(C)]
pub struct DescriptorHeader {
    pub descriptor_size: u16,
    pub item_type: u8,
    pub sub_type: u8,
    pub flags: u16,
    pub id_size: u16,
    pub name_size: u16,
    pub context_size: u16,
    pub priority: u16,
    pub reserved1: u16,
    pub reserved2: u64,
    pub id: *mut c_void,
    pub name: *mut c_void,
    pub context: *mut c_void,
}

#[repr(C)]
pub struct RuleDescriptor {
    pub header: DescriptorHeader,
    pub condition: [*mut c_void; MAX_CONDITIONS],
    pub condition_size: [u16; MAX_CONDITIONS],
    pub condition_type: [u8; MAX_CONDITIONS],
    pub rule_data: [*mut c_void; MAX_RULE_DATA],
    pub rule_data_size: [u16; MAX_RULE_DATA],
    pub time_to_live: u16,
    pub mss_delta: i8,
    pub reverse_mss_delta: i8,
    pub rule_flags: u64,
    pub port_rule_counter: *mut c_void,
    pub port_rule_counter_id_size: u16,
}

impl Default for RuleDescriptor {
    fn default() -> Self {
        Self {
            header: DescriptorHeader::default(),
            condition: [ptr::null_mut(); MAX_CONDITIONS],
            condition_size: [0; MAX_CONDITIONS],
            condition_type: [0; MAX_CONDITIONS],
            rule_data: [ptr::null_mut(); MAX_RULE_DATA],
            rule_data_size: [0; MAX_RULE_DATA],
            time_to_live: 0,
            mss_delta: 0,
            reverse_mss_delta: 0,
            rule_flags: 0,
            port_rule_counter: ptr::null_mut(),
            port_rule_counter_id_size: 0,
        }
    }
}

impl Default for DescriptorHeader {
    fn default() -> Self {
        Self {
            descriptor_size: 0,
            item_type: 0,
            sub_type: 0,
            flags: 0,
            id_size: 0,
            name_size: 0,
            context_size: 0,
            priority: 0,
            reserved1: 0,
            reserved2: 0,
            id: ptr::null_mut(),
            name: ptr::null_mut(),
            context: ptr::null_mut(),
        }
    }
}

#[cfg(target_pointer_width = "64")]
const _: () = {
    assert!(mem::size_of::<SwitchPort>() == 48);
    assert!(mem::size_of::<DescriptorHeader>() == 48);
    assert!(mem::size_of::<RuleDescriptor>() == 152);
    assert!(mem::size_of::<ObjectId>() == 288);
    assert!(mem::offset_of!(DescriptorHeader, id) == 24);
    assert!(mem::offset_of!(RuleDescriptor, rule_data) == 104);
    assert!(mem::offset_of!(RuleDescriptor, rule_flags) == 128);
};

type InitializeDescriptorFn = unsafe extern "system" fn(
    descriptor: *mut DescriptorHeader,
    size: u16,
    item_type: u8,
    id: PCWSTR,
    name: PCWSTR,
) -> u32;
type AddObjectFn = unsafe extern "system" fn(
    parameters: *const SwitchPort,
    object_id: *const ObjectId,
    descriptor: *const c_void,
) -> u32;

/// Loaded `vfpapi.dll`, released on drop
pub struct VfpApi {
    module: HMODULE,
    initialize_descriptor: InitializeDescriptorFn,
    add_object: AddObjectFn,
}

impl VfpApi {
    /// Load from System32 only and resolve both entry points
    pub fn load() -> Result<Self> {
        unsafe {
            let module = LoadLibraryExW(
                &HSTRING::from(VFPAPI),
                HANDLE::default(),
                LOAD_LIBRARY_SEARCH_SYSTEM32,
            )
            .map_err(|e| Error::LibraryLoad {
                library: VFPAPI,
                code: win32_code(&e),
            })?;

            let Some(initialize_descriptor) = GetProcAddress(module, s!("VfcInitializeDescriptor")) else {
                let _ = FreeLibrary(module);
                return Err(Error::ProcNotFound {
                    library: VFPAPI,
                    symbol: INITIALIZE_DESCRIPTOR_SYMBOL,
                });
            };
            let Some(add_object) = GetProcAddress(module, s!("VfcAddObject")) else {
                let _ = FreeLibrary(module);
                return Err(Error::ProcNotFound {
                    library: VFPAPI,
                    symbol: ADD_OBJECT_SYMBOL,
                });
            };

            Ok(Self {
                module,
                initialize_descriptor: mem::transmute::<
                    unsafe extern "system" fn() -> isize,
                    InitializeDescriptorFn,
                >(initialize_descriptor),
                add_object: mem::transmute::<unsafe extern "system" fn() -> isize, AddObjectFn>(
                    add_object,
                ),
            })
        }
    }

    /// Add `rule` to its port; a non-zero VFP status becomes [`Error::Vfp`]
    pub fn add_rule(&self, rule: &RouteRule) -> Result<()> {
        let data = rule.rule_data().encode()?;

        let name = HSTRING::from(rule.name.as_str());
        let layer = HSTRING::from(rule.layer.as_str());
        let group = HSTRING::from(rule.group.as_str());
        let device = HSTRING::from(DEFAULT_DEVICE);
        let switch_name = HSTRING::from(rule.switch_name.as_str());
        let port_name = HSTRING::from(rule.port_name.as_str());
        let extension = GUID::from_u128(FILTER_ID_GUID);

        let mut descriptor = RuleDescriptor::default();
        let status = unsafe {
            (self.initialize_descriptor)(
                &mut descriptor.header,
                mem::size_of::<RuleDescriptor>() as u16,
                VfxItemType::Rule as u8,
                PCWSTR(name.as_ptr()),
                PCWSTR(name.as_ptr()),
            )
        };
        if status != 0 {
            return Err(Error::Vfp(status));
        }
        descriptor.header.priority = rule.priority;
        descriptor.rule_data[0] = data.as_ptr() as *mut c_void;
        descriptor.rule_data_size[0] = rule_data::SIZE as u16;

        let mut object_id = ObjectId {
            count: VfxItemType::Rule as u32,
            ids: [PCWSTR::null(); VFX_ITEM_MAX],
        };
        object_id.ids[VfxItemType::Layer as usize] = PCWSTR(layer.as_ptr());
        object_id.ids[VfxItemType::Group as usize] = PCWSTR(group.as_ptr());

        let parameters = SwitchPort {
            device_name: PCWSTR(device.as_ptr()),
            extension_guid: &extension,
            field1: ptr::null_mut(),
            switch_name: PCWSTR(switch_name.as_ptr()),
            port_name: PCWSTR(port_name.as_ptr()),
            reserved: ptr::null_mut(),
        };

        let status = unsafe {
            (self.add_object)(
                &parameters,
                &object_id,
                &descriptor as *const RuleDescriptor as *const c_void,
            )
        };
        tracing::debug!(
            "VfcAddObject rule={} port={} destination={} => {}",
            rule.name,
            rule.port_name,
            rule.destination,
            status
        );
        match status {
            0 => Ok(()),
            status => Err(Error::Vfp(status)),
        }
    }
}

impl Drop for VfpApi {
    fn drop(&mut self) {
        unsafe {
            let _ = FreeLibrary(self.module);
        }
    }
}
