//! OpenFlow 1.0 messages: the subset a controller needs to program flows,
//! inject packets and follow switch and port state.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rfv_proto::ProtoError;
use rfv_proto::types::MacAddress;
use rfv_proto::wire::WireReader;
use thiserror::Error;

pub const OFP_VERSION: u8 = 0x01;
pub const OFP_HEADER_LEN: usize = 8;
pub const OFP_DEFAULT_PRIORITY: u16 = 0x8000;
pub const OFP_NO_BUFFER: u32 = 0xffff_ffff;
/// Bytes of a packet sent to the controller.
pub const ETH_DATA_LEN: u16 = 1500;

pub mod msg_type {
    pub const HELLO: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const ECHO_REQUEST: u8 = 2;
    pub const ECHO_REPLY: u8 = 3;
    pub const FEATURES_REQUEST: u8 = 5;
    pub const FEATURES_REPLY: u8 = 6;
    pub const PACKET_IN: u8 = 10;
    pub const PORT_STATUS: u8 = 12;
    pub const PACKET_OUT: u8 = 13;
    pub const FLOW_MOD: u8 = 14;
}

const OFPFW_IN_PORT: u32 = 1 << 0;
const OFPFW_DL_VLAN: u32 = 1 << 1;
const OFPFW_DL_SRC: u32 = 1 << 2;
const OFPFW_DL_DST: u32 = 1 << 3;
const OFPFW_DL_TYPE: u32 = 1 << 4;
const OFPFW_NW_PROTO: u32 = 1 << 5;
const OFPFW_TP_SRC: u32 = 1 << 6;
const OFPFW_TP_DST: u32 = 1 << 7;
const OFPFW_NW_SRC_SHIFT: u32 = 8;
const OFPFW_NW_SRC_MASK: u32 = 0x3f << OFPFW_NW_SRC_SHIFT;
const OFPFW_NW_DST_SHIFT: u32 = 14;
const OFPFW_NW_DST_MASK: u32 = 0x3f << OFPFW_NW_DST_SHIFT;
const OFPFW_DL_VLAN_PCP: u32 = 1 << 20;
const OFPFW_NW_TOS: u32 = 1 << 21;
const OFPFW_ALL: u32 = (1 << 22) - 1;

const OFPPS_LINK_DOWN: u32 = 1 << 0;
const OFPPC_PORT_DOWN: u32 = 1 << 0;

const PORT_DESC_LEN: usize = 48;

#[derive(Debug, Error)]
pub enum OfpError {
    #[error("Truncated message: {0}")]
    Truncated(#[from] ProtoError),

    #[error("Unsupported OpenFlow version {0:#04x}")]
    Version(u8),

    #[error("Bad message length {0}")]
    Length(u16),

    #[error("Message too long: {0} bytes")]
    TooLong(usize),
}

/// Port behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PseudoPort {
    PhysicalPort(u16),
    InPort,
    Table,
    Normal,
    Flood,
    AllPorts,
    /// Send to the controller, with at most this many bytes of the packet.
    Controller(u16),
    Local,
}

impl PseudoPort {
    pub fn from_u16(port: u16) -> Self {
        match port {
            0xfff8 => PseudoPort::InPort,
            0xfff9 => PseudoPort::Table,
            0xfffa => PseudoPort::Normal,
            0xfffb => PseudoPort::Flood,
            0xfffc => PseudoPort::AllPorts,
            0xfffd => PseudoPort::Controller(ETH_DATA_LEN),
            0xfffe => PseudoPort::Local,
            p => PseudoPort::PhysicalPort(p),
        }
    }

    pub fn to_u16(self) -> u16 {
        match self {
            PseudoPort::PhysicalPort(p) => p,
            PseudoPort::InPort => 0xfff8,
            PseudoPort::Table => 0xfff9,
            PseudoPort::Normal => 0xfffa,
            PseudoPort::Flood => 0xfffb,
            PseudoPort::AllPorts => 0xfffc,
            PseudoPort::Controller(_) => 0xfffd,
            PseudoPort::Local => 0xfffe,
        }
    }
}

/// "No port" in port fields.
pub const OFPP_NONE: u16 = 0xffff;

/// Fields to match against flows. `None` leaves a field wildcarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pattern {
    pub in_port: Option<u16>,
    pub dl_src: Option<MacAddress>,
    pub dl_dst: Option<MacAddress>,
    pub dl_vlan: Option<u16>,
    pub dl_vlan_pcp: Option<u8>,
    pub dl_type: Option<u16>,
    pub nw_tos: Option<u8>,
    pub nw_proto: Option<u8>,
    pub nw_src: Option<Ipv4Net>,
    pub nw_dst: Option<Ipv4Net>,
    pub tp_src: Option<u16>,
    pub tp_dst: Option<u16>,
}

impl Pattern {
    pub fn wildcards(&self) -> u32 {
        let mut w = OFPFW_ALL;
        let mut clear = |present: bool, bit: u32| {
            if present {
                w &= !bit;
            }
        };
        clear(self.in_port.is_some(), OFPFW_IN_PORT);
        clear(self.dl_vlan.is_some(), OFPFW_DL_VLAN);
        clear(self.dl_src.is_some(), OFPFW_DL_SRC);
        clear(self.dl_dst.is_some(), OFPFW_DL_DST);
        clear(self.dl_type.is_some(), OFPFW_DL_TYPE);
        clear(self.nw_proto.is_some(), OFPFW_NW_PROTO);
        clear(self.tp_src.is_some(), OFPFW_TP_SRC);
        clear(self.tp_dst.is_some(), OFPFW_TP_DST);
        clear(self.dl_vlan_pcp.is_some(), OFPFW_DL_VLAN_PCP);
        clear(self.nw_tos.is_some(), OFPFW_NW_TOS);

        // Address fields count wildcarded low bits; 32 or more means any.
        if let Some(net) = self.nw_src {
            w = (w & !OFPFW_NW_SRC_MASK)
                | ((32 - u32::from(net.prefix_len())) << OFPFW_NW_SRC_SHIFT);
        }
        if let Some(net) = self.nw_dst {
            w = (w & !OFPFW_NW_DST_MASK)
                | ((32 - u32::from(net.prefix_len())) << OFPFW_NW_DST_SHIFT);
        }
        w
    }

    /// The 40-byte `ofp_match`.
    fn encode(&self, out: &mut Vec<u8>) {
        let mac = |m: Option<MacAddress>| m.unwrap_or_default().octets();
        let ip = |n: Option<Ipv4Net>| u32::from(n.map(|n| n.addr()).unwrap_or(Ipv4Addr::UNSPECIFIED));

        out.extend_from_slice(&self.wildcards().to_be_bytes());
        out.extend_from_slice(&self.in_port.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&mac(self.dl_src));
        out.extend_from_slice(&mac(self.dl_dst));
        out.extend_from_slice(&self.dl_vlan.unwrap_or(0).to_be_bytes());
        out.push(self.dl_vlan_pcp.unwrap_or(0));
        out.push(0);
        out.extend_from_slice(&self.dl_type.unwrap_or(0).to_be_bytes());
        out.push(self.nw_tos.unwrap_or(0));
        out.push(self.nw_proto.unwrap_or(0));
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&ip(self.nw_src).to_be_bytes());
        out.extend_from_slice(&ip(self.nw_dst).to_be_bytes());
        out.extend_from_slice(&self.tp_src.unwrap_or(0).to_be_bytes());
        out.extend_from_slice(&self.tp_dst.unwrap_or(0).to_be_bytes());
    }
}

/// Actions associated with flows and packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Output(PseudoPort),
    SetDlSrc(MacAddress),
    SetDlDst(MacAddress),
}

impl Action {
    fn encode(&self, out: &mut Vec<u8>) {
        match self {
            Action::Output(port) => {
                let max_len = match port {
                    PseudoPort::Controller(len) => *len,
                    _ => 0,
                };
                out.extend_from_slice(&0u16.to_be_bytes());
                out.extend_from_slice(&8u16.to_be_bytes());
                out.extend_from_slice(&port.to_u16().to_be_bytes());
                out.extend_from_slice(&max_len.to_be_bytes());
            }
            Action::SetDlSrc(mac) | Action::SetDlDst(mac) => {
                let kind: u16 = if matches!(self, Action::SetDlSrc(_)) { 4 } else { 5 };
                out.extend_from_slice(&kind.to_be_bytes());
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&mac.octets());
                out.extend_from_slice(&[0; 6]);
            }
        }
    }
}

fn encode_actions(actions: &[Action]) -> Vec<u8> {
    let mut out = Vec::new();
    for action in actions {
        action.encode(&mut out);
    }
    out
}

/// How long before a flow entry expires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Permanent,
    ExpiresAfter(u16),
}

impl Timeout {
    pub fn from_secs(secs: u16) -> Self {
        if secs == 0 {
            Timeout::Permanent
        } else {
            Timeout::ExpiresAfter(secs)
        }
    }

    fn to_u16(self) -> u16 {
        match self {
            Timeout::Permanent => 0,
            Timeout::ExpiresAfter(s) => s,
        }
    }
}

/// Type of modification to perform on a flow table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FlowModCmd {
    Add = 0,
    Modify = 1,
    ModifyStrict = 2,
    Delete = 3,
    DeleteStrict = 4,
}

/// A flow table modification sent to a switch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub command: FlowModCmd,
    pub pattern: Pattern,
    pub priority: u16,
    pub actions: Vec<Action>,
    pub cookie: u64,
    pub idle_timeout: Timeout,
    pub hard_timeout: Timeout,
    pub buffer_id: Option<u32>,
    pub out_port: Option<PseudoPort>,
    pub notify_when_removed: bool,
}

impl FlowMod {
    pub fn new(command: FlowModCmd) -> Self {
        Self {
            command,
            pattern: Pattern::default(),
            priority: OFP_DEFAULT_PRIORITY,
            actions: Vec::new(),
            cookie: 0,
            idle_timeout: Timeout::Permanent,
            hard_timeout: Timeout::Permanent,
            buffer_id: None,
            out_port: None,
            notify_when_removed: false,
        }
    }

    pub fn encode(&self, xid: u32) -> Result<Vec<u8>, OfpError> {
        let actions = encode_actions(&self.actions);
        let mut body = Vec::with_capacity(64 + actions.len());
        self.pattern.encode(&mut body);
        body.extend_from_slice(&self.cookie.to_be_bytes());
        body.extend_from_slice(&(self.command as u16).to_be_bytes());
        body.extend_from_slice(&self.idle_timeout.to_u16().to_be_bytes());
        body.extend_from_slice(&self.hard_timeout.to_u16().to_be_bytes());
        body.extend_from_slice(&self.priority.to_be_bytes());
        body.extend_from_slice(&self.buffer_id.unwrap_or(OFP_NO_BUFFER).to_be_bytes());
        let out_port = self.out_port.map(PseudoPort::to_u16).unwrap_or(OFPP_NONE);
        body.extend_from_slice(&out_port.to_be_bytes());
        let flags: u16 = if self.notify_when_removed { 1 } else { 0 };
        body.extend_from_slice(&flags.to_be_bytes());
        body.extend_from_slice(&actions);
        frame(msg_type::FLOW_MOD, xid, &body)
    }
}

/// A packet injected by the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketOut {
    pub buffer_id: Option<u32>,
    pub in_port: Option<u16>,
    pub actions: Vec<Action>,
    pub data: Vec<u8>,
}

impl PacketOut {
    /// Sends `data` out of one port.
    pub fn to_port(port: u16, data: Vec<u8>) -> Self {
        Self {
            buffer_id: None,
            in_port: None,
            actions: vec![Action::Output(PseudoPort::PhysicalPort(port))],
            data,
        }
    }

    pub fn encode(&self, xid: u32) -> Result<Vec<u8>, OfpError> {
        let actions = encode_actions(&self.actions);
        let mut body = Vec::with_capacity(8 + actions.len() + self.data.len());
        body.extend_from_slice(&self.buffer_id.unwrap_or(OFP_NO_BUFFER).to_be_bytes());
        body.extend_from_slice(&self.in_port.unwrap_or(OFPP_NONE).to_be_bytes());
        let actions_len =
            u16::try_from(actions.len()).map_err(|_| OfpError::TooLong(actions.len()))?;
        body.extend_from_slice(&actions_len.to_be_bytes());
        body.extend_from_slice(&actions);
        body.extend_from_slice(&self.data);
        frame(msg_type::PACKET_OUT, xid, &body)
    }
}

/// Prefixes `body` with an OpenFlow header. The whole message must fit the
/// 16-bit length field.
pub fn frame(kind: u8, xid: u32, body: &[u8]) -> Result<Vec<u8>, OfpError> {
    let total = OFP_HEADER_LEN + body.len();
    let len = u16::try_from(total).map_err(|_| OfpError::TooLong(total))?;
    let mut out = Vec::with_capacity(total);
    out.push(OFP_VERSION);
    out.push(kind);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&xid.to_be_bytes());
    out.extend_from_slice(body);
    Ok(out)
}

pub fn hello(xid: u32) -> Result<Vec<u8>, OfpError> {
    frame(msg_type::HELLO, xid, &[])
}

pub fn features_request(xid: u32) -> Result<Vec<u8>, OfpError> {
    frame(msg_type::FEATURES_REQUEST, xid, &[])
}

pub fn echo_reply(xid: u32, payload: &[u8]) -> Result<Vec<u8>, OfpError> {
    frame(msg_type::ECHO_REPLY, xid, payload)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OfpHeader {
    pub version: u8,
    pub kind: u8,
    pub length: u16,
    pub xid: u32,
}

impl OfpHeader {
    pub fn parse(buf: &[u8; OFP_HEADER_LEN]) -> Result<Self, OfpError> {
        let header = Self {
            version: buf[0],
            kind: buf[1],
            length: u16::from_be_bytes([buf[2], buf[3]]),
            xid: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        };
        if header.version != OFP_VERSION {
            return Err(OfpError::Version(header.version));
        }
        if (header.length as usize) < OFP_HEADER_LEN {
            return Err(OfpError::Length(header.length));
        }
        Ok(header)
    }

    pub fn body_len(&self) -> usize {
        self.length as usize - OFP_HEADER_LEN
    }
}

/// Description of a switch port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortDesc {
    pub port_no: u16,
    pub hw_addr: MacAddress,
    pub name: String,
    pub config: u32,
    pub state: u32,
}

impl PortDesc {
    fn parse(reader: &mut WireReader<'_>) -> Result<Self, OfpError> {
        let port_no = reader.u16("port number")?;
        let mut hw = [0u8; 6];
        hw.copy_from_slice(reader.take(6, "port address")?);
        let raw_name = reader.take(16, "port name")?;
        let end = raw_name.iter().position(|b| *b == 0).unwrap_or(raw_name.len());
        let name = String::from_utf8_lossy(&raw_name[..end]).into_owned();
        let config = reader.u32("port config")?;
        let state = reader.u32("port state")?;
        // curr, advertised, supported, peer
        reader.take(16, "port features")?;
        Ok(Self {
            port_no,
            hw_addr: MacAddress(hw),
            name,
            config,
            state,
        })
    }

    /// A numbered switch port, as opposed to the local or reserved ones.
    pub fn is_physical(&self) -> bool {
        self.port_no < 0xff00
    }

    pub fn is_down(&self) -> bool {
        self.state & OFPPS_LINK_DOWN != 0 || self.config & OFPPC_PORT_DOWN != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchFeatures {
    pub datapath_id: u64,
    pub n_buffers: u32,
    pub n_tables: u8,
    pub ports: Vec<PortDesc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    pub buffer_id: Option<u32>,
    pub total_len: u16,
    pub in_port: u16,
    pub reason: u8,
    pub data: Vec<u8>,
}

/// What changed about a physical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortReason {
    Add,
    Delete,
    Modify,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortStatus {
    pub reason: PortReason,
    pub desc: PortDesc,
}

impl PortStatus {
    pub fn is_up(&self) -> bool {
        self.reason != PortReason::Delete && !self.desc.is_down()
    }
}

/// Messages a switch sends to its controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchMessage {
    Hello,
    EchoRequest(Vec<u8>),
    EchoReply,
    FeaturesReply(SwitchFeatures),
    PacketIn(PacketIn),
    PortStatus(PortStatus),
    Error { err_type: u16, code: u16 },
    Other(u8),
}

impl SwitchMessage {
    pub fn parse(header: &OfpHeader, body: &[u8]) -> Result<Self, OfpError> {
        let mut reader = WireReader::new(body);
        Ok(match header.kind {
            msg_type::HELLO => SwitchMessage::Hello,
            msg_type::ECHO_REQUEST => SwitchMessage::EchoRequest(body.to_vec()),
            msg_type::ECHO_REPLY => SwitchMessage::EchoReply,
            msg_type::ERROR => SwitchMessage::Error {
                err_type: reader.u16("error type")?,
                code: reader.u16("error code")?,
            },
            msg_type::FEATURES_REPLY => {
                let datapath_id = reader.u64("datapath id")?;
                let n_buffers = reader.u32("buffer count")?;
                let n_tables = reader.u8("table count")?;
                // pad, capabilities, actions
                reader.take(3 + 4 + 4, "features")?;
                let mut ports = Vec::with_capacity(reader.remaining() / PORT_DESC_LEN);
                while reader.remaining() >= PORT_DESC_LEN {
                    ports.push(PortDesc::parse(&mut reader)?);
                }
                SwitchMessage::FeaturesReply(SwitchFeatures {
                    datapath_id,
                    n_buffers,
                    n_tables,
                    ports,
                })
            }
            msg_type::PACKET_IN => {
                let buffer_id = reader.u32("buffer id")?;
                let total_len = reader.u16("total length")?;
                let in_port = reader.u16("in port")?;
                let reason = reader.u8("reason")?;
                reader.take(1, "pad")?;
                SwitchMessage::PacketIn(PacketIn {
                    buffer_id: (buffer_id != OFP_NO_BUFFER).then_some(buffer_id),
                    total_len,
                    in_port,
                    reason,
                    data: reader.rest().to_vec(),
                })
            }
            msg_type::PORT_STATUS => {
                let reason = match reader.u8("port reason")? {
                    0 => PortReason::Add,
                    1 => PortReason::Delete,
                    _ => PortReason::Modify,
                };
                reader.take(7, "pad")?;
                SwitchMessage::PortStatus(PortStatus {
                    reason,
                    desc: PortDesc::parse(&mut reader)?,
                })
            }
            other => SwitchMessage::Other(other),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn port_desc_bytes(port_no: u16, name: &str, state: u32) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&port_no.to_be_bytes());
        out.extend_from_slice(&[2, 0, 0, 0, 0, port_no as u8]);
        let mut raw_name = [0u8; 16];
        raw_name[..name.len()].copy_from_slice(name.as_bytes());
        out.extend_from_slice(&raw_name);
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&state.to_be_bytes());
        out.extend_from_slice(&[0; 16]);
        out
    }

    pub(crate) fn features_reply_body(dpid: u64, ports: &[u16]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&dpid.to_be_bytes());
        body.extend_from_slice(&256u32.to_be_bytes());
        body.push(1);
        body.extend_from_slice(&[0; 11]);
        for port in ports {
            body.extend_from_slice(&port_desc_bytes(*port, &format!("eth{port}"), 0));
        }
        body
    }

    fn header(kind: u8, body: &[u8]) -> OfpHeader {
        OfpHeader {
            version: OFP_VERSION,
            kind,
            length: (OFP_HEADER_LEN + body.len()) as u16,
            xid: 1,
        }
    }

    #[test]
    fn test_flow_mod_layout() {
        let mut fm = FlowMod::new(FlowModCmd::Add);
        fm.pattern.dl_type = Some(0x0800);
        fm.pattern.nw_dst = Some(Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 0), 24).unwrap());
        fm.priority = 0x8018;
        fm.actions = vec![
            Action::SetDlSrc(MacAddress([2, 0, 0, 0, 0, 1])),
            Action::Output(PseudoPort::PhysicalPort(2)),
        ];

        let bytes = fm.encode(7).unwrap();
        assert_eq!(bytes.len(), 72 + 16 + 8);
        assert_eq!(bytes[0], OFP_VERSION);
        assert_eq!(bytes[1], msg_type::FLOW_MOD);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]) as usize, bytes.len());
        assert_eq!(u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 7);

        let wildcards = u32::from_be_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        assert_eq!(wildcards & OFPFW_DL_TYPE, 0);
        assert_eq!((wildcards & OFPFW_NW_DST_MASK) >> OFPFW_NW_DST_SHIFT, 8);
        assert_ne!(wildcards & OFPFW_IN_PORT, 0);

        // dl_type at match offset 22, nw_dst at 32.
        assert_eq!(&bytes[8 + 22..8 + 24], &[0x08, 0x00]);
        assert_eq!(&bytes[8 + 32..8 + 36], &[10, 1, 0, 0]);
        // command, idle, hard, priority, buffer id, out port, flags.
        assert_eq!(&bytes[56..58], &[0, 0]);
        assert_eq!(&bytes[62..64], &[0x80, 0x18]);
        assert_eq!(&bytes[64..68], &[0xff; 4]);
        assert_eq!(&bytes[68..70], &[0xff, 0xff]);
        // set_dl_src then output.
        assert_eq!(&bytes[72..76], &[0, 4, 0, 16]);
        assert_eq!(&bytes[88..96], &[0, 0, 0, 8, 0, 2, 0, 0]);
    }

    #[test]
    fn test_host_route_wildcards() {
        let pattern = Pattern {
            dl_type: Some(0x0800),
            nw_dst: Some(Ipv4Net::new(Ipv4Addr::new(10, 1, 0, 5), 32).unwrap()),
            ..Default::default()
        };
        assert_eq!(pattern.wildcards() & OFPFW_NW_DST_MASK, 0);
        assert_eq!(Pattern::default().wildcards(), OFPFW_ALL);
    }

    #[test]
    fn test_controller_output() {
        let mut out = Vec::new();
        Action::Output(PseudoPort::Controller(ETH_DATA_LEN)).encode(&mut out);
        assert_eq!(out, vec![0, 0, 0, 8, 0xff, 0xfd, 0x05, 0xdc]);
        assert_eq!(PseudoPort::from_u16(0xfffd), PseudoPort::Controller(ETH_DATA_LEN));
        assert_eq!(PseudoPort::from_u16(3), PseudoPort::PhysicalPort(3));
    }

    #[test]
    fn test_packet_out_layout() {
        let po = PacketOut::to_port(5, vec![0xaa; 20]);
        let bytes = po.encode(9).unwrap();
        assert_eq!(bytes.len(), 8 + 8 + 8 + 20);
        assert_eq!(bytes[1], msg_type::PACKET_OUT);
        assert_eq!(&bytes[8..12], &[0xff; 4]);
        assert_eq!(&bytes[12..14], &[0xff, 0xff]);
        assert_eq!(&bytes[14..16], &[0, 8]);
        assert_eq!(&bytes[20..22], &[0, 5]);
        assert_eq!(&bytes[24..], &[0xaa; 20]);
    }

    #[test]
    fn test_oversized_packet_out_rejected() {
        // Header, fixed fields and one output action leave this much room.
        let room = u16::MAX as usize - 8 - 8 - 8;

        let po = PacketOut::to_port(5, vec![0xaa; room + 1]);
        assert!(matches!(po.encode(1), Err(OfpError::TooLong(n)) if n == u16::MAX as usize + 1));

        let po = PacketOut::to_port(5, vec![0xaa; room]);
        let bytes = po.encode(2).unwrap();
        assert_eq!(bytes.len(), u16::MAX as usize);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), u16::MAX);

        let payload = vec![0; u16::MAX as usize];
        assert!(matches!(echo_reply(3, &payload), Err(OfpError::TooLong(_))));
    }

    #[test]
    fn test_parse_header() {
        let bytes = hello(3).unwrap();
        let raw: [u8; 8] = bytes[..8].try_into().unwrap();
        let h = OfpHeader::parse(&raw).unwrap();
        assert_eq!(h.kind, msg_type::HELLO);
        assert_eq!(h.xid, 3);
        assert_eq!(h.body_len(), 0);

        let mut bad = raw;
        bad[0] = 4;
        assert!(matches!(OfpHeader::parse(&bad), Err(OfpError::Version(4))));
        let mut short = raw;
        short[3] = 4;
        assert!(matches!(OfpHeader::parse(&short), Err(OfpError::Length(4))));
    }

    #[test]
    fn test_parse_features_reply() {
        let body = features_reply_body(0x99, &[1, 2, 0xfffe]);
        let msg = SwitchMessage::parse(&header(msg_type::FEATURES_REPLY, &body), &body).unwrap();
        let SwitchMessage::FeaturesReply(features) = msg else {
            panic!("expected features reply, got {msg:?}");
        };
        assert_eq!(features.datapath_id, 0x99);
        assert_eq!(features.ports.len(), 3);
        assert_eq!(features.ports[1].name, "eth2");
        assert_eq!(features.ports.iter().filter(|p| p.is_physical()).count(), 2);
    }

    #[test]
    fn test_parse_packet_in() {
        let mut body = Vec::new();
        body.extend_from_slice(&OFP_NO_BUFFER.to_be_bytes());
        body.extend_from_slice(&23u16.to_be_bytes());
        body.extend_from_slice(&5u16.to_be_bytes());
        body.push(0);
        body.push(0);
        body.extend_from_slice(&[1, 2, 3]);

        let msg = SwitchMessage::parse(&header(msg_type::PACKET_IN, &body), &body).unwrap();
        assert_eq!(
            msg,
            SwitchMessage::PacketIn(PacketIn {
                buffer_id: None,
                total_len: 23,
                in_port: 5,
                reason: 0,
                data: vec![1, 2, 3],
            })
        );

        let err = SwitchMessage::parse(&header(msg_type::PACKET_IN, &body[..5]), &body[..5]);
        assert!(matches!(err, Err(OfpError::Truncated(_))));
    }

    #[test]
    fn test_parse_port_status() {
        let mut body = vec![2, 0, 0, 0, 0, 0, 0, 0];
        body.extend_from_slice(&port_desc_bytes(3, "eth3", OFPPS_LINK_DOWN));
        let msg = SwitchMessage::parse(&header(msg_type::PORT_STATUS, &body), &body).unwrap();
        let SwitchMessage::PortStatus(status) = msg else {
            panic!("expected port status, got {msg:?}");
        };
        assert_eq!(status.reason, PortReason::Modify);
        assert_eq!(status.desc.port_no, 3);
        assert!(!status.is_up());

        body[0] = 0;
        body[8 + 31] = 0;
        let SwitchMessage::PortStatus(status) =
            SwitchMessage::parse(&header(msg_type::PORT_STATUS, &body), &body).unwrap()
        else {
            panic!("expected port status");
        };
        assert!(status.is_up());
    }
}
