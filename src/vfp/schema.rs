//! Byte layout of the VFP rule objects consumed by `vfpapi.dll`
//!
//! The layout is fixed by the hypervisor switch extension and is not
//! documented; every offset below is part of the contract. `VFP_RULE_IP`
//! uses natural alignment, `VFP_RULE_DATA` is packed to one byte and embeds
//! `VFP_RULE_IP` entries at unaligned offsets.

use super::address::MacAddress;
use crate::{Error, Result};

/// Bumped whenever an offset or size in this module changes
pub const SCHEMA_VERSION: u32 = 1;

/// UTF-16 units in the switch and port name fields, terminator included
pub const NAME_UNITS: usize = 128;
/// Rule entries carried by one `VFP_RULE_DATA`
pub const MAX_RULE_ENTRIES: usize = 4;

/// `{2c3888d9-5580-460e-b89f-0f0209cd6c91}`, the VFP filter extension
pub const FILTER_ID_GUID: u128 = 0x2c3888d9_5580_460e_b89f_0f0209cd6c91;

/// Offsets inside `VFP_RULE_IP`
pub mod rule_ip {
    pub const SIZE: usize = 88;

    pub const HEADER_FIELD1: usize = 0;
    pub const HEADER_FIELD2: usize = 1;
    pub const HEADER_FIELD3: usize = 2;
    pub const FIELD1: usize = 4;
    pub const ACTION: usize = 8;
    pub const FIELD2: usize = 12;
    pub const FIELD3: usize = 16;
    pub const DESTINATION_MAC: usize = 24;
    pub const SOURCE_MAC: usize = 30;
    pub const TRANSPOSITION_FIELD1: usize = 36;
    pub const TRANSPOSITION_FIELD2: usize = 38;
    pub const TRANSPOSITION_FIELD3: usize = 40;
    pub const TRANSPOSITION_FIELD4: usize = 42;
    pub const IPV4_SOURCE: usize = 44;
    pub const IPV4_DESTINATION: usize = 48;
    pub const IPV6_SOURCE: usize = 44;
    pub const IPV6_DESTINATION: usize = 60;
    pub const FIELD4: usize = 76;
    pub const FIELD5: usize = 77;
    pub const FIELD6: usize = 78;
    pub const RESERVED: usize = 80;
}

/// Offsets inside `VFP_RULE_DATA`
pub mod rule_data {
    use super::{rule_ip, MAX_RULE_ENTRIES, NAME_UNITS};

    pub const NUMBER: usize = 0;
    pub const FIELD1: usize = 2;
    pub const RESERVED1: usize = 3;
    pub const SWITCH_NAME: usize = 4;
    pub const PORT_NAME: usize = SWITCH_NAME + NAME_UNITS * 2;
    pub const FIELD2: usize = PORT_NAME + NAME_UNITS * 2;
    pub const FIELD3: usize = FIELD2 + 4;
    pub const FIELD4: usize = FIELD3 + 2;
    pub const FIELD5: usize = FIELD4 + 1;
    pub const FIELD6: usize = FIELD5 + 1;
    pub const FIELD7: usize = FIELD6 + 8;
    pub const FIELD8: usize = FIELD7 + 8;
    pub const GROUP: usize = FIELD8 + 1;
    pub const RESERVED2: usize = GROUP + 4 * 4;
    pub const RESERVED: usize = RESERVED2 + 7;
    pub const RULE_ENTRIES: usize = RESERVED + 34 * 8;
    pub const SIZE: usize = RULE_ENTRIES + MAX_RULE_ENTRIES * rule_ip::SIZE;
}

const _: () = assert!(rule_data::PORT_NAME == 260);
const _: () = assert!(rule_data::FIELD2 == 516);
const _: () = assert!(rule_data::GROUP == 541);
const _: () = assert!(rule_data::RULE_ENTRIES == 836);
const _: () = assert!(rule_data::SIZE == 1188);

/// `NdisGftHeaderGroupTranspositionAction*`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(u32)]
pub enum HeaderAction {
    #[default]
    Undefined = 0,
    Modify = 1,
    Ignore = 2,
    Push = 3,
    Pop = 4,
}

/// `VFX_ITEM_TYPE`; also indexes the object id path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum VfxItemType {
    None = 0,
    Specifier,
    General,
    Layer,
    Group,
    Rule,
    NatPool,
    NatRange,
    Information,
    Flow,
    Space,
    Mapping,
    Packet,
    PortName,
    UnifiedFlow,
    HeaderTransposition,
    Status,
    QosQueue,
    Port,
    NatPortBinding,
    InformationEx,
    Condition,
    DtlsSession,
    PaDiscoveryRoute,
    PingInfo,
    Tag,
    PortRuleCounter,
    VmContext,
    FlowToken,
    SimplifiedUnifiedFlowId,
    VmSwitchPort,
    VmSwitch,
    Node,
    TraceFilter,
    TrackedPacket,
}

/// Number of `VfxItemType` values, the length of the object id path
pub const VFX_ITEM_MAX: usize = VfxItemType::TrackedPacket as usize + 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleIpHeader {
    pub field1: u8,
    pub field2: u8,
    pub field3: u16,
}

/// Ethernet header rewrite carried by a rule entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transposition {
    pub destination_mac: MacAddress,
    pub source_mac: MacAddress,
    pub field1: u16,
    pub field2: u16,
    pub field3: u16,
    pub field4: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddresses {
    V4 { source: [u8; 4], destination: [u8; 4] },
    V6 { source: [u8; 16], destination: [u8; 16] },
}

impl Default for IpAddresses {
    fn default() -> Self {
        IpAddresses::V4 {
            source: [0; 4],
            destination: [0; 4],
        }
    }
}

/// One `VFP_RULE_IP` entry
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuleIp {
    pub header: RuleIpHeader,
    pub field1: u32,
    pub action: HeaderAction,
    pub field2: u32,
    pub field3: u64,
    pub transposition: Transposition,
    pub addresses: IpAddresses,
    pub field4: u8,
    pub field5: u8,
    pub field6: u8,
    pub reserved: [u16; 2],
}

impl RuleIp {
    /// Write the entry into `out[..rule_ip::SIZE]`; padding stays zero
    pub fn encode_into(&self, out: &mut [u8]) {
        use rule_ip::*;

        let mut w = FieldWriter::new(&mut out[..SIZE]);
        w.put_u8(HEADER_FIELD1, self.header.field1);
        w.put_u8(HEADER_FIELD2, self.header.field2);
        w.put_u16(HEADER_FIELD3, self.header.field3);
        w.put_u32(FIELD1, self.field1);
        w.put_u32(ACTION, self.action as u32);
        w.put_u32(FIELD2, self.field2);
        w.put_u64(FIELD3, self.field3);

        let t = &self.transposition;
        w.put_bytes(DESTINATION_MAC, &t.destination_mac.0);
        w.put_bytes(SOURCE_MAC, &t.source_mac.0);
        w.put_u16(TRANSPOSITION_FIELD1, t.field1);
        w.put_u16(TRANSPOSITION_FIELD2, t.field2);
        w.put_u16(TRANSPOSITION_FIELD3, t.field3);
        w.put_u8(TRANSPOSITION_FIELD4, t.field4);

        match &self.addresses {
            IpAddresses::V4 { source, destination } => {
                w.put_bytes(IPV4_SOURCE, source);
                w.put_bytes(IPV4_DESTINATION, destination);
            }
            IpAddresses::V6 { source, destination } => {
                w.put_bytes(IPV6_SOURCE, source);
                w.put_bytes(IPV6_DESTINATION, destination);
            }
        }

        w.put_u8(FIELD4, self.field4);
        w.put_u8(FIELD5, self.field5);
        w.put_u8(FIELD6, self.field6);
        w.put_u16(RESERVED, self.reserved[0]);
        w.put_u16(RESERVED + 2, self.reserved[1]);
    }
}

/// `VFP_RULE_DATA`, the rule payload handed to `VfcAddObject`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleData {
    pub field1: bool,
    pub switch_name: String,
    pub port_name: String,
    pub field2: u32,
    pub field3: u16,
    pub field4: bool,
    pub field5: bool,
    pub field6: u64,
    pub field7: u64,
    pub field8: bool,
    pub groups: [[u8; 4]; 4],
    /// `Number` is derived from the entry count
    pub entries: Vec<RuleIp>,
}

impl RuleData {
    pub fn encode(&self) -> Result<Vec<u8>> {
        use rule_data::*;

        if self.entries.len() > MAX_RULE_ENTRIES {
            return Err(Error::InvalidArgument(format!(
                "{} rule entries, at most {} fit",
                self.entries.len(),
                MAX_RULE_ENTRIES
            )));
        }

        let mut buf = vec![0u8; SIZE];
        let mut w = FieldWriter::new(&mut buf);
        w.put_u16(NUMBER, self.entries.len() as u16);
        w.put_u8(FIELD1, u8::from(self.field1));
        w.put_wide(SWITCH_NAME, &self.switch_name)?;
        w.put_wide(PORT_NAME, &self.port_name)?;
        w.put_u32(FIELD2, self.field2);
        w.put_u16(FIELD3, self.field3);
        w.put_u8(FIELD4, u8::from(self.field4));
        w.put_u8(FIELD5, u8::from(self.field5));
        w.put_u64(FIELD6, self.field6);
        w.put_u64(FIELD7, self.field7);
        w.put_u8(FIELD8, u8::from(self.field8));
        for (i, group) in self.groups.iter().enumerate() {
            w.put_bytes(GROUP + i * 4, group);
        }

        for (i, entry) in self.entries.iter().enumerate() {
            let start = RULE_ENTRIES + i * rule_ip::SIZE;
            entry.encode_into(&mut buf[start..start + rule_ip::SIZE]);
        }
        Ok(buf)
    }
}

/// Little-endian stores at absolute offsets
struct FieldWriter<'a> {
    buf: &'a mut [u8],
}

impl<'a> FieldWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    fn put_bytes(&mut self, offset: usize, bytes: &[u8]) {
        self.buf[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    fn put_u8(&mut self, offset: usize, v: u8) {
        self.buf[offset] = v;
    }

    fn put_u16(&mut self, offset: usize, v: u16) {
        self.put_bytes(offset, &v.to_le_bytes());
    }

    fn put_u32(&mut self, offset: usize, v: u32) {
        self.put_bytes(offset, &v.to_le_bytes());
    }

    fn put_u64(&mut self, offset: usize, v: u64) {
        self.put_bytes(offset, &v.to_le_bytes());
    }

    /// NUL-terminated `WCHAR[NAME_UNITS]`
    fn put_wide(&mut self, offset: usize, s: &str) -> Result<()> {
        let units: Vec<u16> = s.encode_utf16().collect();
        if units.len() >= NAME_UNITS {
            return Err(Error::NameTooLong {
                name: s.to_string(),
                max: NAME_UNITS - 1,
            });
        }
        for (i, unit) in units.iter().enumerate() {
            self.put_u16(offset + i * 2, *unit);
        }
        Ok(())
    }
}
