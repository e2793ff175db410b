//! Route and host state mirrored from the kernel, and the directives that
//! describe them.

use std::fmt;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rfv_proto::defs::ROUTE_PRIORITY_BASE;
use rfv_proto::{Action, Directive, FlowOption, Interface, MacAddress, Match, RouteModType, VmId};

/// A kernel route with a next hop. Equality is by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub destination: Ipv4Net,
    pub gateway: Ipv4Addr,
    pub interface: Interface,
}

impl RouteEntry {
    pub fn netmask(&self) -> Ipv4Addr {
        self.destination.netmask()
    }

    /// Longer prefixes get higher priority so they win over shorter ones.
    pub fn priority(&self) -> u16 {
        ROUTE_PRIORITY_BASE + u16::from(self.destination.prefix_len())
    }

    /// Directive installing this route towards a gateway at `gateway_mac`.
    pub fn add_directive(&self, vm_id: VmId, gateway_mac: MacAddress) -> Directive {
        Directive::new(RouteModType::Add, vm_id)
            .with_match(Match::ipv4(self.destination.addr(), self.netmask()))
            .with_action(Action::set_eth_src(self.interface.hwaddress))
            .with_action(Action::set_eth_dst(gateway_mac))
            .with_action(Action::output(self.interface.port))
            .with_option(FlowOption::priority(self.priority()))
    }

    /// Removal needs neither the gateway's address nor a port.
    pub fn delete_directive(&self, vm_id: VmId) -> Directive {
        Directive::new(RouteModType::Delete, vm_id)
            .with_match(Match::ipv4(self.destination.addr(), self.netmask()))
            .with_option(FlowOption::priority(self.priority()))
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} via {} dev {}",
            self.destination, self.gateway, self.interface.name
        )
    }
}

/// A resolved neighbor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub address: Ipv4Addr,
    pub hwaddress: MacAddress,
    pub interface: Interface,
}

impl HostEntry {
    pub fn priority(&self) -> u16 {
        ROUTE_PRIORITY_BASE + 32
    }

    fn host_match(&self) -> Match {
        Match::ipv4(self.address, Ipv4Addr::BROADCAST)
    }

    pub fn add_directive(&self, vm_id: VmId) -> Directive {
        Directive::new(RouteModType::Add, vm_id)
            .with_match(self.host_match())
            .with_action(Action::set_eth_src(self.interface.hwaddress))
            .with_action(Action::set_eth_dst(self.hwaddress))
            .with_action(Action::output(self.interface.port))
            .with_option(FlowOption::priority(self.priority()))
    }

    pub fn delete_directive(&self, vm_id: VmId) -> Directive {
        Directive::new(RouteModType::Delete, vm_id)
            .with_match(self.host_match())
            .with_option(FlowOption::priority(self.priority()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOp {
    Add,
    Delete,
}

/// A route change waiting for its gateway to resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRoute {
    pub op: RouteOp,
    pub entry: RouteEntry,
    /// Resolution attempts so far.
    pub attempts: u32,
}

impl PendingRoute {
    pub fn new(op: RouteOp, entry: RouteEntry) -> Self {
        Self {
            op,
            entry,
            attempts: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfv_proto::{ActionType, MatchType, OptionType};

    fn eth1() -> Interface {
        Interface::new(1, "eth1", MacAddress([2, 0, 0, 0, 0, 1]))
    }

    fn route(prefix: &str) -> RouteEntry {
        RouteEntry {
            destination: prefix.parse().unwrap(),
            gateway: Ipv4Addr::new(192, 168, 1, 1),
            interface: eth1(),
        }
    }

    #[test]
    fn test_route_add_directive() {
        let gw_mac = MacAddress([2, 0, 0, 0, 0, 0xfe]);
        let d = route("10.0.0.0/24").add_directive(77, gw_mac);

        assert_eq!(d.mod_type, RouteModType::Add);
        assert_eq!(d.target, 77);
        assert_eq!(d.matches.len(), 1);
        assert_eq!(d.matches[0].kind(), MatchType::Ipv4);
        assert_eq!(
            d.matches[0].as_ipv4(),
            Some((Ipv4Addr::new(10, 0, 0, 0), Ipv4Addr::new(255, 255, 255, 0)))
        );
        let kinds: Vec<_> = d.actions.iter().map(|a| a.kind()).collect();
        assert_eq!(
            kinds,
            vec![ActionType::SetEthSrc, ActionType::SetEthDst, ActionType::Output]
        );
        assert_eq!(d.actions[1].as_mac(), Some(gw_mac));
        assert_eq!(d.actions[2].as_u32(), Some(1));
        assert_eq!(d.options[0].kind(), OptionType::Priority);
        assert_eq!(d.options[0].as_u16(), Some(0x8000 + 24));
    }

    #[test]
    fn test_route_delete_directive() {
        let d = route("10.2.0.0/16").delete_directive(77);
        assert_eq!(d.mod_type, RouteModType::Delete);
        assert!(d.actions.is_empty());
        assert_eq!(d.options[0].as_u16(), Some(0x8000 + 16));
    }

    #[test]
    fn test_longer_prefix_wins() {
        assert!(route("10.0.0.0/24").priority() > route("10.0.0.0/8").priority());
        assert_eq!(route("0.0.0.0/0").priority(), 0x8000);
    }

    #[test]
    fn test_host_directive() {
        let host = HostEntry {
            address: Ipv4Addr::new(192, 168, 1, 1),
            hwaddress: MacAddress([2, 0, 0, 0, 0, 0xfe]),
            interface: eth1(),
        };
        let d = host.add_directive(77);
        assert_eq!(
            d.matches[0].as_ipv4(),
            Some((Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::BROADCAST))
        );
        assert_eq!(d.options[0].as_u16(), Some(0x8000 + 32));
    }
}
