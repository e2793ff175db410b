use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// VM identifier, a 48-bit MAC held in the low bits.
pub type VmId = u64;

/// OpenFlow datapath identifier.
pub type DpId = u64;

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// Pack the address into the low 48 bits, first octet most significant.
    pub fn to_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    pub fn from_u64(value: u64) -> Self {
        let b = value.to_be_bytes();
        MacAddress([b[2], b[3], b[4], b[5], b[6], b[7]])
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        MacAddress(octets)
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseMacError(String);

impl fmt::Display for ParseMacError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid MAC address: {}", self.0)
    }
}

impl std::error::Error for ParseMacError {}

impl FromStr for MacAddress {
    type Err = ParseMacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| ParseMacError(s.to_string()))?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| ParseMacError(s.to_string()))?;
        }
        if parts.next().is_some() {
            return Err(ParseMacError(s.to_string()));
        }
        Ok(MacAddress(octets))
    }
}

/// A VM network interface taking part in virtualization.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interface {
    pub port: u32,
    pub name: String,
    pub hwaddress: MacAddress,
    pub address: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub active: bool,
}

impl Interface {
    pub fn new(port: u32, name: impl Into<String>, hwaddress: MacAddress) -> Self {
        Self {
            port,
            name: name.into(),
            hwaddress,
            address: None,
            netmask: None,
            active: true,
        }
    }

    pub fn with_address(mut self, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.address = Some(address);
        self.netmask = Some(netmask);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddress = "02:AB:00:00:10:ff".parse().unwrap();
        assert_eq!(mac.octets(), [0x02, 0xab, 0x00, 0x00, 0x10, 0xff]);
        assert_eq!(mac.to_string(), "02:ab:00:00:10:ff");

        assert!("02:ab:00:00:10".parse::<MacAddress>().is_err());
        assert!("02:ab:00:00:10:ff:01".parse::<MacAddress>().is_err());
        assert!("zz:ab:00:00:10:ff".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_mac_as_vm_id() {
        let mac = MacAddress([0x12, 0xa0, 0xa0, 0xa0, 0xa0, 0xa0]);
        let id = mac.to_u64();
        assert_eq!(id, 0x12a0_a0a0_a0a0);
        assert_eq!(MacAddress::from_u64(id), mac);
    }
}
