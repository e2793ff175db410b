//! Discovery of the VM interfaces that take part in virtualization.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use rfv_proto::{Interface, MacAddress, VmId};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result};

/// Port number from the trailing digits of an interface name.
pub fn port_from_name(name: &str) -> Option<u32> {
    let digits = name.len() - name.trim_end_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    name[name.len() - digits..].parse().ok()
}

#[derive(Default)]
struct Found {
    mac: Option<MacAddress>,
    address: Option<(Ipv4Addr, Ipv4Addr)>,
    loopback: bool,
}

fn scan() -> Result<BTreeMap<String, Found>> {
    let mut found: BTreeMap<String, Found> = BTreeMap::new();
    for ifaddr in getifaddrs()? {
        let entry = found.entry(ifaddr.interface_name.clone()).or_default();
        entry.loopback |= ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK);

        let Some(addr) = ifaddr.address.as_ref() else {
            continue;
        };
        if let Some(link) = addr.as_link_addr() {
            if let Some(mac) = link.addr() {
                entry.mac = Some(MacAddress(mac));
            }
        } else if let Some(inet) = addr.as_sockaddr_in() {
            let mask = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| m.ip())
                .unwrap_or(Ipv4Addr::BROADCAST);
            entry.address = Some((inet.ip(), mask));
        }
    }
    Ok(found)
}

/// Hardware address of one interface.
pub fn hardware_address(name: &str) -> Result<MacAddress> {
    scan()?
        .remove(name)
        .and_then(|f| f.mac)
        .ok_or_else(|| ClientError::InterfaceNotFound(name.to_string()))
}

/// VM identity: the 48-bit hardware address of the identifying interface.
pub fn vm_id_from_interface(name: &str) -> Result<VmId> {
    Ok(hardware_address(name)?.to_u64())
}

/// Lists the virtualized interfaces: every Ethernet interface except the
/// loopback and the management interface, numbered by the trailing digits of
/// its name.
pub fn load_interfaces(mgmt: &str) -> Result<Vec<Interface>> {
    let mut interfaces = Vec::new();
    for (name, found) in scan()? {
        if found.loopback || name == mgmt {
            continue;
        }
        let Some(mac) = found.mac else {
            debug!(name, "Skipping interface without a hardware address");
            continue;
        };
        let Some(port) = port_from_name(&name) else {
            warn!(name, "Skipping interface without a port number");
            continue;
        };

        let mut interface = Interface::new(port, name, mac);
        if let Some((address, netmask)) = found.address {
            interface = interface.with_address(address, netmask);
        }
        info!(
            name = %interface.name,
            port = interface.port,
            mac = %interface.hwaddress,
            "Loaded interface"
        );
        interfaces.push(interface);
    }
    interfaces.sort_by_key(|i| i.port);
    Ok(interfaces)
}

/// Kernel index of an interface.
pub fn interface_index(name: &str) -> Option<u32> {
    let c_name = CString::new(name).ok()?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    (index != 0).then_some(index)
}

/// Name of the interface with a kernel index.
pub fn interface_name(index: u32) -> Option<String> {
    let mut name = [0u8; libc::IF_NAMESIZE];
    let result = unsafe { libc::if_indextoname(index, name.as_mut_ptr() as *mut libc::c_char) };
    if result.is_null() {
        return None;
    }
    let len = name.iter().position(|&c| c == 0).unwrap_or(name.len());
    Some(String::from_utf8_lossy(&name[..len]).into_owned())
}
