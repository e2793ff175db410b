//! Well-known names and numbers shared by every component.

/// Channel between VMs and the registrar.
pub const CLIENT_SERVER_CHANNEL: &str = "rfclient<->rfserver";

/// Channel between the registrar and the switch translator.
pub const SERVER_PROXY_CHANNEL: &str = "rfserver<->rfproxy";

pub const SERVER_ID: &str = "rfserver";
pub const PROXY_ID: &str = "rfproxy";

/// Ethertype of the frames a VM emits to reveal which switch port it sits on.
pub const ETH_P_RFV_MAP: u16 = 0x0A0A;

pub const ETH_P_IPV4: u16 = 0x0800;
pub const ETH_P_ARP: u16 = 0x0806;
pub const ETH_P_LLDP: u16 = 0x88cc;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_OSPF: u8 = 89;

pub const BGP_PORT: u16 = 179;
pub const RIP_PORT: u16 = 520;

/// Base priority of route flows; the prefix length is added on top so more
/// specific routes win.
pub const ROUTE_PRIORITY_BASE: u16 = 0x8000;

/// Participant name of a VM on the client channel.
pub fn vm_participant(vm_id: u64) -> String {
    vm_id.to_string()
}
