//! VFP (Virtual Filtering Platform) rule marshalling
//!
//! Parameters arrive as strings, are parsed into fixed-size fields and
//! encoded into the binary objects `vfpapi.dll` expects. Only
//! [`ffi`] touches the library itself.

pub mod address;
pub mod routes;
pub mod schema;

#[cfg(windows)]
pub mod ffi;

pub use address::{format_mac_dashed, parse_ipv4, parse_mac, parse_subnet, Ipv4Subnet, MacAddress};
pub use routes::{
    command_file_name, find_port_name, parse_gateway_mac, validate_port_id, VfpRoute, VfpRoutes,
};
pub use schema::{HeaderAction, IpAddresses, RuleData, RuleIp, Transposition, VfxItemType};

use crate::{Error, Result};

pub const VFPAPI: &str = "vfpapi.dll";
pub const INITIALIZE_DESCRIPTOR_SYMBOL: &str = "VfcInitializeDescriptor";
pub const ADD_OBJECT_SYMBOL: &str = "VfcAddObject";

pub const DEFAULT_LAYER: &str = "VNET_PA_ROUTE_LAYER";
pub const DEFAULT_GROUP: &str = "VNET_GROUP_PA_ROUTE_IPV4_OUT";
/// Control device of the VFP switch extension
pub const DEFAULT_DEVICE: &str = r"\\.\VfpExt";

/// Result codes of the exported `VfpAddRule`; positive values are VFP statuses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ReturnCode {
    Success = 0,
    FailedToLoadDll = -1,
    FailedToGetInitializeDescriptor = -2,
    FailedToGetAddObject = -3,
    InvalidIpAddress = -4,
    InvalidMacAddress = -5,
    InvalidArgument = -6,
}

/// Map a failed add-rule attempt to the value returned across the DLL boundary
pub fn return_code(err: &Error) -> i32 {
    let code = match err {
        Error::LibraryLoad { .. } => ReturnCode::FailedToLoadDll,
        Error::ProcNotFound { symbol, .. } if *symbol == INITIALIZE_DESCRIPTOR_SYMBOL => {
            ReturnCode::FailedToGetInitializeDescriptor
        }
        Error::ProcNotFound { .. } => ReturnCode::FailedToGetAddObject,
        Error::InvalidIpv4(_) => ReturnCode::InvalidIpAddress,
        Error::InvalidMac(_) => ReturnCode::InvalidMacAddress,
        Error::Vfp(status) => return *status as i32,
        _ => ReturnCode::InvalidArgument,
    };
    code as i32
}

/// A PA route rewrite: packets to `destination` get `gateway_mac` as their
/// destination MAC on `port_name`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRule {
    pub name: String,
    pub switch_name: String,
    pub port_name: String,
    pub layer: String,
    pub group: String,
    pub destination: Ipv4Subnet,
    pub priority: u16,
    pub gateway_mac: MacAddress,
}

impl RouteRule {
    pub fn builder() -> RouteRuleBuilder {
        RouteRuleBuilder::default()
    }

    /// Parse the string parameters of one add-rule call
    pub fn parse(
        name: &str,
        switch_name: &str,
        port_name: &str,
        destination: &str,
        gateway_mac: &str,
        priority: u16,
    ) -> Result<Self> {
        RouteRule::builder()
            .name(name)
            .switch_name(switch_name)
            .port_name(port_name)
            .destination(parse_subnet(destination)?)
            .gateway_mac(parse_mac(gateway_mac)?)
            .priority(priority)
            .build()
    }

    /// Single `Modify` entry rewriting the destination MAC for the subnet
    pub fn rule_data(&self) -> RuleData {
        RuleData {
            switch_name: self.switch_name.clone(),
            port_name: self.port_name.clone(),
            entries: vec![RuleIp {
                action: HeaderAction::Modify,
                transposition: Transposition {
                    destination_mac: self.gateway_mac,
                    source_mac: MacAddress::ZERO,
                    ..Default::default()
                },
                addresses: IpAddresses::V4 {
                    source: [0; 4],
                    destination: self.destination.address,
                },
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct RouteRuleBuilder {
    name: String,
    switch_name: String,
    port_name: String,
    layer: Option<String>,
    group: Option<String>,
    destination: Option<Ipv4Subnet>,
    priority: u16,
    gateway_mac: Option<MacAddress>,
}

impl RouteRuleBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn switch_name(mut self, name: impl Into<String>) -> Self {
        self.switch_name = name.into();
        self
    }

    pub fn port_name(mut self, name: impl Into<String>) -> Self {
        self.port_name = name.into();
        self
    }

    pub fn layer(mut self, layer: impl Into<String>) -> Self {
        self.layer = Some(layer.into());
        self
    }

    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn destination(mut self, subnet: Ipv4Subnet) -> Self {
        self.destination = Some(subnet);
        self
    }

    pub fn priority(mut self, priority: u16) -> Self {
        self.priority = priority;
        self
    }

    pub fn gateway_mac(mut self, mac: MacAddress) -> Self {
        self.gateway_mac = Some(mac);
        self
    }

    pub fn build(self) -> Result<RouteRule> {
        if self.name.is_empty() {
            return Err(Error::InvalidArgument("rule name cannot be empty".into()));
        }
        if self.port_name.is_empty() {
            return Err(Error::InvalidArgument("port name cannot be empty".into()));
        }
        Ok(RouteRule {
            name: self.name,
            switch_name: self.switch_name,
            port_name: self.port_name,
            layer: self.layer.unwrap_or_else(|| DEFAULT_LAYER.to_string()),
            group: self.group.unwrap_or_else(|| DEFAULT_GROUP.to_string()),
            destination: self
                .destination
                .ok_or_else(|| Error::InvalidArgument("destination subnet is required".into()))?,
            priority: self.priority,
            gateway_mac: self
                .gateway_mac
                .ok_or_else(|| Error::InvalidArgument("gateway MAC is required".into()))?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule() -> RouteRule {
        RouteRule::parse(
            "route-to-master",
            "KubeSwitch",
            "6f1d7b5c-44a1-4b7e-9d7b-3c2f3a5e9f01",
            "172.19.1.0/24",
            "00:15:5d:0a:bc:ff",
            100,
        )
        .unwrap()
    }

    #[test]
    fn test_parse_fills_defaults() {
        let rule = rule();
        assert_eq!(rule.layer, DEFAULT_LAYER);
        assert_eq!(rule.group, DEFAULT_GROUP);
        assert_eq!(rule.destination.prefix_len, 24);
        assert_eq!(rule.priority, 100);
    }

    #[test]
    fn test_parse_errors_map_to_return_codes() {
        let bad_ip = RouteRule::parse("r", "s", "p", "172.19.1/24", "00:15:5d:0a:bc:ff", 1).unwrap_err();
        assert_eq!(return_code(&bad_ip), ReturnCode::InvalidIpAddress as i32);

        let bad_mac = RouteRule::parse("r", "s", "p", "172.19.1.0/24", "00:15:5d", 1).unwrap_err();
        assert_eq!(return_code(&bad_mac), ReturnCode::InvalidMacAddress as i32);

        let no_name = RouteRule::parse("", "s", "p", "172.19.1.0/24", "00:15:5d:0a:bc:ff", 1).unwrap_err();
        assert_eq!(return_code(&no_name), ReturnCode::InvalidArgument as i32);
    }

    #[test]
    fn test_loader_errors_map_to_return_codes() {
        let load = Error::LibraryLoad { library: VFPAPI, code: 126 };
        assert_eq!(return_code(&load), -1);

        let init = Error::ProcNotFound { library: VFPAPI, symbol: INITIALIZE_DESCRIPTOR_SYMBOL };
        assert_eq!(return_code(&init), -2);

        let add = Error::ProcNotFound { library: VFPAPI, symbol: ADD_OBJECT_SYMBOL };
        assert_eq!(return_code(&add), -3);

        assert_eq!(return_code(&Error::Vfp(0x13)), 0x13);
    }

    #[test]
    fn test_rule_data_carries_route() {
        let buf = rule().rule_data().encode().unwrap();
        let entry = schema::rule_data::RULE_ENTRIES;

        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 1);
        assert_eq!(buf[entry + schema::rule_ip::ACTION], HeaderAction::Modify as u8);
        assert_eq!(
            &buf[entry + schema::rule_ip::DESTINATION_MAC..entry + schema::rule_ip::DESTINATION_MAC + 6],
            &[0x00, 0x15, 0x5d, 0x0a, 0xbc, 0xff]
        );
        assert_eq!(
            &buf[entry + schema::rule_ip::IPV4_DESTINATION..entry + schema::rule_ip::IPV4_DESTINATION + 4],
            &[172, 19, 1, 0]
        );
    }
}
