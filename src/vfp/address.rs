//! IPv4 and MAC address parsing for VFP rule fields

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::{Error, Result};

/// Six-octet hardware address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);
}

/// Upper-case, dash separated, the form vfpctrl expects
impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}-{b:02X}-{c:02X}-{d:02X}-{e:02X}-{g:02X}")
    }
}

impl FromStr for MacAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        parse_mac(s)
    }
}

/// `00-15-5D-0A-BC-FF`
pub fn format_mac_dashed(mac: &MacAddress) -> String {
    mac.to_string()
}

/// Accepts `aa:bb:cc:dd:ee:ff` or `AA-BB-CC-DD-EE-FF`
pub fn parse_mac(s: &str) -> Result<MacAddress> {
    let invalid = || Error::InvalidMac(s.to_string());

    let mut octets = [0u8; 6];
    let mut parts = s.trim().split([':', '-']);
    for octet in octets.iter_mut() {
        let part = parts.next().ok_or_else(invalid)?;
        if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(invalid());
        }
        *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
    }
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok(MacAddress(octets))
}

/// Dotted-quad IPv4 address, octets in network order
pub fn parse_ipv4(s: &str) -> Result<[u8; 4]> {
    Ipv4Addr::from_str(s.trim())
        .map(|addr| addr.octets())
        .map_err(|_| Error::InvalidIpv4(s.to_string()))
}

/// `a.b.c.d/len` destination prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Subnet {
    pub address: [u8; 4],
    pub prefix_len: u8,
}

impl Ipv4Subnet {
    pub fn host(address: [u8; 4]) -> Self {
        Self { address, prefix_len: 32 }
    }
}

impl fmt::Display for Ipv4Subnet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", Ipv4Addr::from(self.address), self.prefix_len)
    }
}

/// Prefix length defaults to 32 when omitted
pub fn parse_subnet(s: &str) -> Result<Ipv4Subnet> {
    let s = s.trim();
    let Some((address, prefix)) = s.split_once('/') else {
        return parse_ipv4(s).map(Ipv4Subnet::host);
    };
    let prefix_len = prefix
        .parse::<u8>()
        .ok()
        .filter(|len| *len <= 32)
        .ok_or_else(|| Error::InvalidIpv4(s.to_string()))?;
    Ok(Ipv4Subnet {
        address: parse_ipv4(address)?,
        prefix_len,
    })
}
