//! Renders directives and datapath configuration into OpenFlow flow mods.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rfv_proto::defs::{
    BGP_PORT, ETH_P_ARP, ETH_P_IPV4, IPPROTO_ICMP, IPPROTO_OSPF, IPPROTO_TCP, IPPROTO_UDP,
    RIP_PORT,
};
use rfv_proto::messages::DatapathOperation;
use rfv_proto::tlv::{ActionType, Field, MatchType, OptionType, TlvType};
use rfv_proto::{Directive, ErrorKind, RouteModType};
use thiserror::Error;
use tracing::{debug, warn};

use crate::openflow::{Action, ETH_DATA_LEN, FlowMod, FlowModCmd, PseudoPort, Timeout};

/// Priority of the flows that steer control traffic to the controller.
/// Above every route flow, which top out at 0x8000 + 32.
pub const CONTROL_PRIORITY: u16 = 0xf000;

/// RIPv2 multicast group.
const RIP_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 9);

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("Unsupported mandatory {family} field {name}")]
    Unsupported {
        family: &'static str,
        name: &'static str,
    },

    #[error("Malformed {family} field {name}")]
    Malformed {
        family: &'static str,
        name: &'static str,
    },
}

impl TranslateError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TranslateError::Unsupported { .. } => ErrorKind::UnsupportedField,
            TranslateError::Malformed { .. } => ErrorKind::MalformedField,
        }
    }
}

pub type Result<T> = std::result::Result<T, TranslateError>;

fn malformed<T: TlvType>(field: &Field<T>) -> TranslateError {
    TranslateError::Malformed {
        family: T::FAMILY,
        name: field.kind().name(),
    }
}

/// Drops an unsupported optional field, fails on a mandatory one.
fn unsupported<T: TlvType>(field: &Field<T>) -> Result<()> {
    if field.is_optional() {
        warn!(family = T::FAMILY, field = %field, "Dropping unsupported optional field");
        Ok(())
    } else {
        Err(TranslateError::Unsupported {
            family: T::FAMILY,
            name: field.kind().name(),
        })
    }
}

fn port16<T: TlvType>(field: &Field<T>) -> Result<u16> {
    field
        .as_u32()
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| malformed(field))
}

/// Builds the flow mod for a directive. Fields apply in list order; a later
/// scalar field overwrites an earlier one.
pub fn render(directive: &Directive) -> Result<FlowMod> {
    let command = match directive.mod_type {
        RouteModType::Add => FlowModCmd::Add,
        RouteModType::Delete => FlowModCmd::DeleteStrict,
    };
    let mut fm = FlowMod::new(command);

    for m in &directive.matches {
        match m.kind() {
            MatchType::Ipv4 => {
                let (addr, mask) = m.as_ipv4().ok_or_else(|| malformed(m))?;
                // OpenFlow 1.0 only matches prefixes; the mask's leading
                // ones give the length.
                let prefix = u32::from(mask).leading_ones() as u8;
                let net = Ipv4Net::new(addr, prefix).map_err(|_| malformed(m))?;
                fm.pattern.dl_type = Some(ETH_P_IPV4);
                fm.pattern.nw_dst = Some(net.trunc());
            }
            MatchType::Ethernet => {
                fm.pattern.dl_dst = Some(m.as_mac().ok_or_else(|| malformed(m))?);
            }
            MatchType::Ethertype => {
                fm.pattern.dl_type = Some(m.as_u16().ok_or_else(|| malformed(m))?);
            }
            MatchType::NwProto => {
                fm.pattern.nw_proto = Some(m.as_u8().ok_or_else(|| malformed(m))?);
            }
            MatchType::TpSrc => {
                fm.pattern.tp_src = Some(m.as_u16().ok_or_else(|| malformed(m))?);
            }
            MatchType::TpDst => {
                fm.pattern.tp_dst = Some(m.as_u16().ok_or_else(|| malformed(m))?);
            }
            MatchType::InPort => {
                fm.pattern.in_port = Some(port16(m)?);
            }
            MatchType::Ipv6 | MatchType::Mpls | MatchType::Vlan => unsupported(m)?,
        }
    }

    for a in &directive.actions {
        match a.kind() {
            ActionType::Output => {
                let port = PseudoPort::from_u16(port16(a)?);
                fm.actions.push(Action::Output(port));
            }
            ActionType::SetEthSrc => {
                fm.actions
                    .push(Action::SetDlSrc(a.as_mac().ok_or_else(|| malformed(a))?));
            }
            ActionType::SetEthDst => {
                fm.actions
                    .push(Action::SetDlDst(a.as_mac().ok_or_else(|| malformed(a))?));
            }
            ActionType::PushMpls
            | ActionType::PopMpls
            | ActionType::SwapMpls
            | ActionType::Drop
            | ActionType::Sflow => unsupported(a)?,
        }
    }

    for o in &directive.options {
        match o.kind() {
            OptionType::Priority => {
                fm.priority = o.as_u16().ok_or_else(|| malformed(o))?;
            }
            OptionType::IdleTimeout => {
                fm.idle_timeout = Timeout::from_secs(o.as_u16().ok_or_else(|| malformed(o))?);
            }
            OptionType::HardTimeout => {
                fm.hard_timeout = Timeout::from_secs(o.as_u16().ok_or_else(|| malformed(o))?);
            }
            OptionType::CtId => unsupported(o)?,
        }
    }

    debug!(directive = %directive, command = ?fm.command, "Directive rendered");
    Ok(fm)
}

/// Flow mod for one datapath configuration step.
pub fn datapath_config(operation: DatapathOperation) -> FlowMod {
    let mut fm = FlowMod::new(FlowModCmd::Add);
    fm.priority = CONTROL_PRIORITY;
    fm.actions = vec![Action::Output(PseudoPort::Controller(ETH_DATA_LEN))];

    let p = &mut fm.pattern;
    match operation {
        DatapathOperation::ClearFlowTable => {
            fm.command = FlowModCmd::Delete;
            fm.priority = 0;
            fm.actions.clear();
        }
        DatapathOperation::Ospf => {
            p.dl_type = Some(ETH_P_IPV4);
            p.nw_proto = Some(IPPROTO_OSPF);
        }
        DatapathOperation::Bgp => {
            p.dl_type = Some(ETH_P_IPV4);
            p.nw_proto = Some(IPPROTO_TCP);
            p.tp_dst = Some(BGP_PORT);
        }
        DatapathOperation::Ripv2 => {
            p.dl_type = Some(ETH_P_IPV4);
            p.nw_proto = Some(IPPROTO_UDP);
            p.nw_dst = Some(Ipv4Net::from(RIP_GROUP));
            p.tp_dst = Some(RIP_PORT);
        }
        DatapathOperation::Arp => {
            p.dl_type = Some(ETH_P_ARP);
        }
        DatapathOperation::Icmp => {
            p.dl_type = Some(ETH_P_IPV4);
            p.nw_proto = Some(IPPROTO_ICMP);
        }
        DatapathOperation::ForwardAll => {
            // Matches everything, below the protocol flows.
            fm.priority = 1;
        }
    }
    fm
}

#[cfg(test)]
mod tests {
    use super::*;
    use rfv_proto::tlv::{Action as TlvAction, FlowOption, Match};
    use rfv_proto::types::MacAddress;

    const SRC: MacAddress = MacAddress([2, 0, 0, 0, 0, 1]);
    const GW: MacAddress = MacAddress([2, 0, 0, 0, 0, 2]);

    fn route(prefix: [u8; 4], mask: [u8; 4]) -> Directive {
        Directive::new(RouteModType::Add, 0x99)
            .with_match(Match::ipv4(Ipv4Addr::from(prefix), Ipv4Addr::from(mask)))
            .with_action(TlvAction::set_eth_src(SRC))
            .with_action(TlvAction::set_eth_dst(GW))
            .with_action(TlvAction::output(2))
            .with_option(FlowOption::priority(0x8000 + 24))
    }

    #[test]
    fn test_render_route() {
        let fm = render(&route([10, 1, 0, 0], [255, 255, 255, 0])).unwrap();
        assert_eq!(fm.command, FlowModCmd::Add);
        assert_eq!(fm.pattern.dl_type, Some(ETH_P_IPV4));
        assert_eq!(
            fm.pattern.nw_dst,
            Some(Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 0), 24).unwrap())
        );
        assert_eq!(fm.priority, 0x8018);
        assert_eq!(
            fm.actions,
            vec![
                Action::SetDlSrc(SRC),
                Action::SetDlDst(GW),
                Action::Output(PseudoPort::PhysicalPort(2)),
            ]
        );
        assert_eq!(fm.idle_timeout, Timeout::Permanent);
    }

    #[test]
    fn test_render_delete_is_strict() {
        let mut d = route([10, 1, 0, 0], [255, 255, 0, 0]);
        d.mod_type = RouteModType::Delete;
        let fm = render(&d).unwrap();
        assert_eq!(fm.command, FlowModCmd::DeleteStrict);
        assert_eq!(fm.pattern.nw_dst.map(|n| n.prefix_len()), Some(16));
    }

    #[test]
    fn test_optional_fields_dropped() {
        let d = route([10, 1, 0, 0], [255, 255, 255, 0])
            .with_match(Match::from_u16(MatchType::Vlan, 100).unwrap())
            .with_action(TlvAction::from_raw(ActionType::Sflow, &[]).unwrap())
            .with_option(FlowOption::from_u64(OptionType::CtId, 5).unwrap());
        let fm = render(&d).unwrap();
        assert_eq!(fm.pattern.dl_vlan, None);
        assert_eq!(fm.actions.len(), 3);
    }

    #[test]
    fn test_mandatory_unsupported_aborts() {
        let d = route([10, 1, 0, 0], [255, 255, 255, 0]).with_match(
            Match::from_ipv6(MatchType::Ipv6, "2001:db8::".parse().unwrap(), "ffff::".parse().unwrap())
                .unwrap(),
        );
        let err = render(&d).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedField);

        let d = route([10, 1, 0, 0], [255, 255, 255, 0])
            .with_action(TlvAction::from_u32(ActionType::PushMpls, 16).unwrap());
        assert_eq!(render(&d).unwrap_err().kind(), ErrorKind::UnsupportedField);
    }

    #[test]
    fn test_later_field_overwrites() {
        let d = Directive::new(RouteModType::Add, 1)
            .with_match(Match::ethertype(ETH_P_ARP))
            .with_match(Match::ethertype(ETH_P_IPV4))
            .with_option(FlowOption::priority(10))
            .with_option(FlowOption::priority(20))
            .with_option(FlowOption::idle_timeout(300));
        let fm = render(&d).unwrap();
        assert_eq!(fm.pattern.dl_type, Some(ETH_P_IPV4));
        assert_eq!(fm.priority, 20);
        assert_eq!(fm.idle_timeout, Timeout::ExpiresAfter(300));
    }

    #[test]
    fn test_out_of_range_port() {
        let d = Directive::new(RouteModType::Add, 1).with_action(TlvAction::output(70_000));
        assert_eq!(render(&d).unwrap_err().kind(), ErrorKind::MalformedField);
    }

    #[test]
    fn test_datapath_config_flows() {
        let clear = datapath_config(DatapathOperation::ClearFlowTable);
        assert_eq!(clear.command, FlowModCmd::Delete);
        assert!(clear.actions.is_empty());
        assert_eq!(clear.pattern, Default::default());

        let bgp = datapath_config(DatapathOperation::Bgp);
        assert_eq!(bgp.pattern.nw_proto, Some(IPPROTO_TCP));
        assert_eq!(bgp.pattern.tp_dst, Some(BGP_PORT));
        assert_eq!(
            bgp.actions,
            vec![Action::Output(PseudoPort::Controller(ETH_DATA_LEN))]
        );
        assert!(bgp.priority > 0x8000 + 32);

        let rip = datapath_config(DatapathOperation::Ripv2);
        assert_eq!(rip.pattern.nw_dst.map(|n| n.addr()), Some(RIP_GROUP));
        assert_eq!(rip.pattern.nw_dst.map(|n| n.prefix_len()), Some(32));

        let all = datapath_config(DatapathOperation::ForwardAll);
        assert_eq!(all.pattern, Default::default());
        assert_eq!(all.actions.len(), 1);
    }
}
