//! `vfprules.json` route definitions and their vfpctrl rendering

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::address::{format_mac_dashed, parse_mac, parse_subnet, MacAddress};
use super::{RouteRule, DEFAULT_GROUP, DEFAULT_LAYER};
use crate::{Error, Result};

pub const VFPCTRL: &str = r"C:\Windows\System32\vfpctrl.exe";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfpRoute {
    pub name: String,
    pub subnet: String,
    pub gateway: String,
    pub priority: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfpRoutes {
    #[serde(default)]
    pub routes: Vec<VfpRoute>,
}

impl VfpRoutes {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// Rules for every route whose gateway MAC is known; the rest are logged and skipped
    pub fn resolve_rules(
        &self,
        switch_name: &str,
        port: &str,
        gateways: &HashMap<String, MacAddress>,
    ) -> Vec<RouteRule> {
        self.routes
            .iter()
            .filter_map(|route| {
                let mac = gateway_mac(route, gateways)?;
                route
                    .to_rule(switch_name, port, mac)
                    .inspect_err(|e| tracing::warn!("Skipping route {}: {}", route.name, e))
                    .ok()
            })
            .collect()
    }

    /// Append one vfpctrl line per resolvable route to `vfp-rules-<port_id>.cmd`
    /// in `dir`. Returns the file and the number of lines written.
    pub fn write_command_file(
        &self,
        dir: &Path,
        port_id: &uuid::Uuid,
        port: &str,
        gateways: &HashMap<String, MacAddress>,
    ) -> Result<(PathBuf, usize)> {
        let path = dir.join(command_file_name(port_id));
        let file = OpenOptions::new().append(true).create(true).open(&path)?;
        let mut writer = BufWriter::new(file);

        let mut written = 0;
        for route in &self.routes {
            tracing::info!(
                "Name: {}, Subnet: {}, Gateway: {}, Priority: {}",
                route.name,
                route.subnet,
                route.gateway,
                route.priority
            );
            let Some(mac) = gateway_mac(route, gateways) else {
                continue;
            };
            writeln!(writer, "{}", route.to_vfpctrl_command(port, mac))?;
            written += 1;
        }
        writer.flush()?;
        Ok((path, written))
    }
}

fn gateway_mac(route: &VfpRoute, gateways: &HashMap<String, MacAddress>) -> Option<MacAddress> {
    let mac = gateways.get(route.gateway.trim()).copied();
    if mac.is_none() {
        tracing::info!(
            "No MAC known for gateway {}, continuing with the other routes",
            route.gateway
        );
    }
    mac
}

impl VfpRoute {
    pub fn priority(&self) -> Result<u16> {
        self.priority
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid priority: {}", self.priority)))
    }

    /// `vfpctrl /add-rule-ex` line equivalent to [`VfpRoute::to_rule`]
    pub fn to_vfpctrl_command(&self, port: &str, gateway_mac: MacAddress) -> String {
        format!(
            "{VFPCTRL} /port {port} /layer {DEFAULT_LAYER} /group {DEFAULT_GROUP} /add-rule-ex \
             \"{name} {name} * * * {subnet} * 128 * {priority} transpose *,0/*,0 modify 00-00-00-00-00-00 {mac}\"",
            name = self.name,
            subnet = self.subnet,
            priority = self.priority,
            mac = format_mac_dashed(&gateway_mac),
        )
    }

    /// Resolved rule for the binary API; `gateway_mac` is the MAC behind `gateway`
    pub fn to_rule(&self, switch_name: &str, port: &str, gateway_mac: MacAddress) -> Result<RouteRule> {
        RouteRule::builder()
            .name(&self.name)
            .switch_name(switch_name)
            .port_name(port)
            .destination(parse_subnet(&self.subnet)?)
            .priority(self.priority()?)
            .gateway_mac(gateway_mac)
            .build()
    }
}

/// `vfp-rules-<port id>.cmd`
pub fn command_file_name(port_id: &uuid::Uuid) -> String {
    format!("vfp-rules-{}.cmd", port_id)
}

/// `172.19.1.1=00-15-5D-0A-BC-FF`: MAC to rewrite to for routes via that gateway
pub fn parse_gateway_mac(arg: &str) -> Result<(String, MacAddress)> {
    let (gateway, mac) = arg
        .split_once('=')
        .ok_or_else(|| Error::InvalidArgument(format!("expected GATEWAY=MAC: {arg}")))?;
    super::address::parse_ipv4(gateway)?;
    Ok((gateway.trim().to_string(), parse_mac(mac)?))
}

/// Port name of the switch port whose friendly name is `friendly_name`, from
/// `vfpctrl /list-vmswitch-port` output. The name precedes its friendly name.
pub fn find_port_name(listing: &str, friendly_name: &str) -> Option<String> {
    let mut last_port = None;
    for line in listing.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        match key.trim() {
            "Port name" => last_port = Some(value.trim().to_string()),
            "Port Friendly name" if value.trim().eq_ignore_ascii_case(friendly_name.trim()) => {
                return last_port;
            }
            _ => {}
        }
    }
    None
}

/// Ports are addressed by their GUID
pub fn validate_port_id(port_id: &str) -> Result<uuid::Uuid> {
    uuid::Uuid::parse_str(port_id.trim())
        .map_err(|_| Error::InvalidArgument(format!("port id is not a GUID: {port_id}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTES: &str = r#"{
        "routes": [
            { "name": "to-master", "subnet": "172.19.1.0/24", "gateway": "172.19.1.1", "priority": "100" },
            { "name": "to-nodes", "subnet": "10.5.0.0/16", "gateway": "172.19.1.1", "priority": "x" }
        ]
    }"#;

    fn gateway() -> MacAddress {
        MacAddress([0x00, 0x15, 0x5d, 0x0a, 0xbc, 0xff])
    }

    #[test]
    fn test_parse_routes() {
        let routes = VfpRoutes::from_json(ROUTES).unwrap();
        assert_eq!(routes.routes.len(), 2);
        assert_eq!(routes.routes[0].gateway, "172.19.1.1");
        assert_eq!(routes.routes[0].priority().unwrap(), 100);
        assert!(routes.routes[1].priority().is_err());
    }

    #[test]
    fn test_empty_and_invalid_json() {
        assert!(VfpRoutes::from_json("{}").unwrap().routes.is_empty());
        assert!(matches!(VfpRoutes::from_json("{"), Err(Error::Json(_))));
    }

    #[test]
    fn test_vfpctrl_command() {
        let routes = VfpRoutes::from_json(ROUTES).unwrap();
        let cmd = routes.routes[0].to_vfpctrl_command("PORT-1", gateway());
        assert_eq!(
            cmd,
            r#"C:\Windows\System32\vfpctrl.exe /port PORT-1 /layer VNET_PA_ROUTE_LAYER /group VNET_GROUP_PA_ROUTE_IPV4_OUT /add-rule-ex "to-master to-master * * * 172.19.1.0/24 * 128 * 100 transpose *,0/*,0 modify 00-00-00-00-00-00 00-15-5D-0A-BC-FF""#
        );
    }

    #[test]
    fn test_to_rule() {
        let routes = VfpRoutes::from_json(ROUTES).unwrap();
        let rule = routes.routes[0].to_rule("KubeSwitch", "PORT-1", gateway()).unwrap();
        assert_eq!(rule.destination.address, [172, 19, 1, 0]);
        assert_eq!(rule.gateway_mac, gateway());
        assert!(routes.routes[1].to_rule("KubeSwitch", "PORT-1", gateway()).is_err());
    }

    #[test]
    fn test_validate_port_id() {
        assert!(validate_port_id("6f1d7b5c-44a1-4b7e-9d7b-3c2f3a5e9f01").is_ok());
        assert!(validate_port_id("not-a-port").is_err());
    }

    #[test]
    fn test_parse_gateway_mac() {
        let (gw, mac) = parse_gateway_mac("172.19.1.1=00:15:5d:0a:bc:ff").unwrap();
        assert_eq!(gw, "172.19.1.1");
        assert_eq!(mac, gateway());
        assert!(matches!(parse_gateway_mac("172.19.1.1"), Err(Error::InvalidArgument(_))));
        assert!(matches!(parse_gateway_mac("gw=00:15:5d:0a:bc:ff"), Err(Error::InvalidIpv4(_))));
        assert!(matches!(parse_gateway_mac("172.19.1.1=00:15"), Err(Error::InvalidMac(_))));
    }

    #[test]
    fn test_find_port_name() {
        let listing = "\
ITEM LIST
===========
  Port name          : 3A1E1E52-AAAA-4D5E-9C3B-000000000001
  Port Friendly name : Ethernet-External
  Port name          : 9C0D2B71-BBBB-4F7E-8D2A-000000000002
  Port Friendly name : 6F1D7B5C-44A1-4B7E-9D7B-3C2F3A5E9F01
";
        assert_eq!(
            find_port_name(listing, "6f1d7b5c-44a1-4b7e-9d7b-3c2f3a5e9f01").as_deref(),
            Some("9C0D2B71-BBBB-4F7E-8D2A-000000000002")
        );
        assert_eq!(find_port_name(listing, "missing"), None);
    }

    #[test]
    fn test_resolve_rules_skips_unknown_gateways_and_bad_routes() {
        let routes = VfpRoutes::from_json(ROUTES).unwrap();
        let known = HashMap::from([("172.19.1.1".to_string(), gateway())]);
        let rules = routes.resolve_rules("KubeSwitch", "PORT-1", &known);
        // the second route has an invalid priority
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].name, "to-master");

        assert!(routes.resolve_rules("KubeSwitch", "PORT-1", &HashMap::new()).is_empty());
    }

    #[test]
    fn test_write_command_file_appends() {
        let dir = tempfile::tempdir().unwrap();
        let routes = VfpRoutes::from_json(ROUTES).unwrap();
        let port_id = validate_port_id("6f1d7b5c-44a1-4b7e-9d7b-3c2f3a5e9f01").unwrap();
        let known = HashMap::from([("172.19.1.1".to_string(), gateway())]);

        let (path, written) = routes
            .write_command_file(dir.path(), &port_id, "PORT-1", &known)
            .unwrap();
        assert_eq!(written, 2);
        assert_eq!(
            path.file_name().unwrap().to_str().unwrap(),
            "vfp-rules-6f1d7b5c-44a1-4b7e-9d7b-3c2f3a5e9f01.cmd"
        );

        routes
            .write_command_file(dir.path(), &port_id, "PORT-1", &HashMap::new())
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(VFPCTRL));
        assert!(lines[1].contains("\"to-nodes to-nodes * * * 10.5.0.0/16 * 128 * x "));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vfprules.json");
        std::fs::write(&path, ROUTES).unwrap();
        assert_eq!(VfpRoutes::load(&path).unwrap().routes.len(), 2);
    }
}
