//! Message families exchanged over the two channels.
//!
//! Each channel carries a closed family of messages. Decoding goes through
//! the family type, so a type code outside the family is rejected at the
//! boundary instead of reaching a processor.

use std::fmt;

use crate::error::{ProtoError, Result};
use crate::tlv::{Action, Field, FlowOption, Match, TlvType};
use crate::types::{DpId, VmId};
use crate::wire::{FieldSet, FieldSetWriter, WireReader};

/// Wire type codes, shared by both families.
pub mod code {
    pub const VM_REGISTER_REQUEST: u32 = 0;
    pub const VM_REGISTER_RESPONSE: u32 = 1;
    pub const VM_CONFIG: u32 = 2;
    pub const DATAPATH_CONFIG: u32 = 3;
    pub const ROUTE_MOD: u32 = 4;
    pub const FLOW_MOD: u32 = 5;
    pub const DATAPATH_JOIN: u32 = 6;
    pub const DATAPATH_LEAVE: u32 = 7;
    pub const VM_MAP: u32 = 8;
    pub const PORT_CONFIG: u32 = 9;
    pub const DATAPATH_PORT_STATUS: u32 = 10;
    pub const DATA_PLANE_MAP: u32 = 11;
}

// Field tags inside a field set.
const TAG_VM_ID: u8 = 1;
const TAG_VM_PORT: u8 = 2;
const TAG_DP_ID: u8 = 3;
const TAG_DP_PORT: u8 = 4;
const TAG_VS_ID: u8 = 5;
const TAG_VS_PORT: u8 = 6;
const TAG_ACCEPT: u8 = 7;
const TAG_N_PORTS: u8 = 8;
const TAG_OPERATION: u8 = 9;
const TAG_IS_BOOTSTRAP: u8 = 10;
const TAG_UP: u8 = 11;

/// A member of a message family.
pub trait Message: Sized + Send + Sync + fmt::Debug + 'static {
    fn type_code(&self) -> u32;
    fn encode(&self) -> Result<Vec<u8>>;
    fn decode(type_code: u32, payload: &[u8]) -> Result<Self>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RouteModType {
    Add = 0,
    Delete = 1,
}

impl TryFrom<u8> for RouteModType {
    type Error = ProtoError;

    fn try_from(v: u8) -> Result<Self> {
        match v {
            0 => Ok(RouteModType::Add),
            1 => Ok(RouteModType::Delete),
            v => Err(ProtoError::InvalidValue {
                what: "route mod type",
                value: u64::from(v),
            }),
        }
    }
}

/// A request to add or remove one forwarding rule.
///
/// As a route report the target is the originating VM; as a flow directive
/// it is the datapath that must install the rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directive {
    pub mod_type: RouteModType,
    pub target: u64,
    pub matches: Vec<Match>,
    pub actions: Vec<Action>,
    pub options: Vec<FlowOption>,
}

impl Directive {
    pub fn new(mod_type: RouteModType, target: u64) -> Self {
        Self {
            mod_type,
            target,
            matches: Vec::new(),
            actions: Vec::new(),
            options: Vec::new(),
        }
    }

    pub fn with_match(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    pub fn with_action(mut self, a: Action) -> Self {
        self.actions.push(a);
        self
    }

    pub fn with_option(mut self, o: FlowOption) -> Self {
        self.options.push(o);
        self
    }

    /// `mod: u8, target: u64, then each list as count: u8 + fields`.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(16);
        out.push(self.mod_type as u8);
        out.extend_from_slice(&self.target.to_be_bytes());
        encode_list(&self.matches, &mut out)?;
        encode_list(&self.actions, &mut out)?;
        encode_list(&self.options, &mut out)?;
        Ok(out)
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reader = WireReader::new(payload);
        let mod_type = RouteModType::try_from(reader.u8("route mod type")?)?;
        let target = reader.u64("directive target")?;
        let matches = decode_list(&mut reader)?;
        let actions = decode_list(&mut reader)?;
        let options = decode_list(&mut reader)?;
        if !reader.is_empty() {
            return Err(ProtoError::Length {
                what: "directive".into(),
                expected: payload.len() - reader.remaining(),
                actual: payload.len(),
            });
        }
        Ok(Self {
            mod_type,
            target,
            matches,
            actions,
            options,
        })
    }
}

impl fmt::Display for Directive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} target={:#x}", self.mod_type, self.target)?;
        for m in &self.matches {
            write!(f, " {m}")?;
        }
        for a in &self.actions {
            write!(f, " {a}")?;
        }
        for o in &self.options {
            write!(f, " {o}")?;
        }
        Ok(())
    }
}

fn encode_list<T: TlvType>(fields: &[Field<T>], out: &mut Vec<u8>) -> Result<()> {
    let count = u8::try_from(fields.len()).map_err(|_| ProtoError::TooLong {
        what: T::FAMILY,
        limit: usize::from(u8::MAX),
        actual: fields.len(),
    })?;
    out.push(count);
    for field in fields {
        field.encode(out);
    }
    Ok(())
}

fn decode_list<T: TlvType>(reader: &mut WireReader<'_>) -> Result<Vec<Field<T>>> {
    let count = reader.u8(T::FAMILY)?;
    (0..count).map(|_| Field::decode(reader)).collect()
}

/// Datapath configuration steps issued by the registrar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DatapathOperation {
    ClearFlowTable = 0,
    Ospf = 1,
    Bgp = 2,
    Ripv2 = 3,
    Arp = 4,
    Icmp = 5,
    ForwardAll = 6,
}

impl DatapathOperation {
    /// Base configuration applied to every datapath, in issue order.
    pub const BASE: [DatapathOperation; 6] = [
        DatapathOperation::ClearFlowTable,
        DatapathOperation::Ospf,
        DatapathOperation::Bgp,
        DatapathOperation::Ripv2,
        DatapathOperation::Arp,
        DatapathOperation::Icmp,
    ];
}

impl TryFrom<u32> for DatapathOperation {
    type Error = ProtoError;

    fn try_from(v: u32) -> Result<Self> {
        Ok(match v {
            0 => DatapathOperation::ClearFlowTable,
            1 => DatapathOperation::Ospf,
            2 => DatapathOperation::Bgp,
            3 => DatapathOperation::Ripv2,
            4 => DatapathOperation::Arp,
            5 => DatapathOperation::Icmp,
            6 => DatapathOperation::ForwardAll,
            v => {
                return Err(ProtoError::InvalidValue {
                    what: "datapath operation",
                    value: u64::from(v),
                });
            }
        })
    }
}

/// Port state changes pushed from the registrar to a VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortOperation {
    /// The port lost its datapath counterpart.
    Reset = 0,
    /// The port is usable again and should be re-mapped.
    Map = 1,
}

impl TryFrom<u32> for PortOperation {
    type Error = ProtoError;

    fn try_from(v: u32) -> Result<Self> {
        match v {
            0 => Ok(PortOperation::Reset),
            1 => Ok(PortOperation::Map),
            v => Err(ProtoError::InvalidValue {
                what: "port operation",
                value: u64::from(v),
            }),
        }
    }
}

/// Messages on the VM ↔ registrar channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    VmRegisterRequest { vm_id: VmId },
    VmRegisterResponse { accept: bool },
    VmConfig { n_ports: u32 },
    RouteMod(Directive),
    PortConfig {
        vm_id: VmId,
        vm_port: u32,
        operation: PortOperation,
    },
}

impl Message for ClientMessage {
    fn type_code(&self) -> u32 {
        match self {
            ClientMessage::VmRegisterRequest { .. } => code::VM_REGISTER_REQUEST,
            ClientMessage::VmRegisterResponse { .. } => code::VM_REGISTER_RESPONSE,
            ClientMessage::VmConfig { .. } => code::VM_CONFIG,
            ClientMessage::RouteMod(_) => code::ROUTE_MOD,
            ClientMessage::PortConfig { .. } => code::PORT_CONFIG,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        match self {
            ClientMessage::VmRegisterRequest { vm_id } => {
                FieldSetWriter::new().u64(TAG_VM_ID, *vm_id).finish()
            }
            ClientMessage::VmRegisterResponse { accept } => {
                FieldSetWriter::new().bool(TAG_ACCEPT, *accept).finish()
            }
            ClientMessage::VmConfig { n_ports } => {
                FieldSetWriter::new().u32(TAG_N_PORTS, *n_ports).finish()
            }
            ClientMessage::RouteMod(directive) => directive.encode(),
            ClientMessage::PortConfig {
                vm_id,
                vm_port,
                operation,
            } => FieldSetWriter::new()
                .u64(TAG_VM_ID, *vm_id)
                .u32(TAG_VM_PORT, *vm_port)
                .u32(TAG_OPERATION, *operation as u32)
                .finish(),
        }
    }

    fn decode(type_code: u32, payload: &[u8]) -> Result<Self> {
        match type_code {
            code::VM_REGISTER_REQUEST => {
                let f = FieldSet::parse(payload, &[TAG_VM_ID])?;
                Ok(ClientMessage::VmRegisterRequest {
                    vm_id: f.u64(TAG_VM_ID)?,
                })
            }
            code::VM_REGISTER_RESPONSE => {
                let f = FieldSet::parse(payload, &[TAG_ACCEPT])?;
                Ok(ClientMessage::VmRegisterResponse {
                    accept: f.bool(TAG_ACCEPT)?,
                })
            }
            code::VM_CONFIG => {
                let f = FieldSet::parse(payload, &[TAG_N_PORTS])?;
                Ok(ClientMessage::VmConfig {
                    n_ports: f.u32(TAG_N_PORTS)?,
                })
            }
            code::ROUTE_MOD => Ok(ClientMessage::RouteMod(Directive::decode(payload)?)),
            code::PORT_CONFIG => {
                let f = FieldSet::parse(payload, &[TAG_VM_ID, TAG_VM_PORT, TAG_OPERATION])?;
                Ok(ClientMessage::PortConfig {
                    vm_id: f.u64(TAG_VM_ID)?,
                    vm_port: f.u32(TAG_VM_PORT)?,
                    operation: PortOperation::try_from(f.u32(TAG_OPERATION)?)?,
                })
            }
            code => Err(ProtoError::UnknownType {
                family: "client message",
                code,
            }),
        }
    }
}

/// Messages on the registrar ↔ switch translator channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMessage {
    DatapathConfig {
        dp_id: DpId,
        operation: DatapathOperation,
    },
    FlowMod(Directive),
    DatapathJoin {
        dp_id: DpId,
        n_ports: u32,
        is_bootstrap: bool,
    },
    DatapathLeave { dp_id: DpId },
    VmMap {
        vm_id: VmId,
        vm_port: u32,
        vs_id: DpId,
        vs_port: u32,
    },
    DatapathPortStatus { dp_id: DpId, dp_port: u32, up: bool },
    DataPlaneMap {
        dp_id: DpId,
        dp_port: u32,
        vs_id: DpId,
        vs_port: u32,
    },
}

impl Message for ProxyMessage {
    fn type_code(&self) -> u32 {
        match self {
            ProxyMessage::DatapathConfig { .. } => code::DATAPATH_CONFIG,
            ProxyMessage::FlowMod(_) => code::FLOW_MOD,
            ProxyMessage::DatapathJoin { .. } => code::DATAPATH_JOIN,
            ProxyMessage::DatapathLeave { .. } => code::DATAPATH_LEAVE,
            ProxyMessage::VmMap { .. } => code::VM_MAP,
            ProxyMessage::DatapathPortStatus { .. } => code::DATAPATH_PORT_STATUS,
            ProxyMessage::DataPlaneMap { .. } => code::DATA_PLANE_MAP,
        }
    }

    fn encode(&self) -> Result<Vec<u8>> {
        match self {
            ProxyMessage::DatapathConfig { dp_id, operation } => FieldSetWriter::new()
                .u64(TAG_DP_ID, *dp_id)
                .u32(TAG_OPERATION, *operation as u32)
                .finish(),
            ProxyMessage::FlowMod(directive) => directive.encode(),
            ProxyMessage::DatapathJoin {
                dp_id,
                n_ports,
                is_bootstrap,
            } => FieldSetWriter::new()
                .u64(TAG_DP_ID, *dp_id)
                .u32(TAG_N_PORTS, *n_ports)
                .bool(TAG_IS_BOOTSTRAP, *is_bootstrap)
                .finish(),
            ProxyMessage::DatapathLeave { dp_id } => {
                FieldSetWriter::new().u64(TAG_DP_ID, *dp_id).finish()
            }
            ProxyMessage::VmMap {
                vm_id,
                vm_port,
                vs_id,
                vs_port,
            } => FieldSetWriter::new()
                .u64(TAG_VM_ID, *vm_id)
                .u32(TAG_VM_PORT, *vm_port)
                .u64(TAG_VS_ID, *vs_id)
                .u32(TAG_VS_PORT, *vs_port)
                .finish(),
            ProxyMessage::DatapathPortStatus { dp_id, dp_port, up } => FieldSetWriter::new()
                .u64(TAG_DP_ID, *dp_id)
                .u32(TAG_DP_PORT, *dp_port)
                .bool(TAG_UP, *up)
                .finish(),
            ProxyMessage::DataPlaneMap {
                dp_id,
                dp_port,
                vs_id,
                vs_port,
            } => FieldSetWriter::new()
                .u64(TAG_DP_ID, *dp_id)
                .u32(TAG_DP_PORT, *dp_port)
                .u64(TAG_VS_ID, *vs_id)
                .u32(TAG_VS_PORT, *vs_port)
                .finish(),
        }
    }

    fn decode(type_code: u32, payload: &[u8]) -> Result<Self> {
        match type_code {
            code::DATAPATH_CONFIG => {
                let f = FieldSet::parse(payload, &[TAG_DP_ID, TAG_OPERATION])?;
                Ok(ProxyMessage::DatapathConfig {
                    dp_id: f.u64(TAG_DP_ID)?,
                    operation: DatapathOperation::try_from(f.u32(TAG_OPERATION)?)?,
                })
            }
            code::FLOW_MOD => Ok(ProxyMessage::FlowMod(Directive::decode(payload)?)),
            code::DATAPATH_JOIN => {
                let f = FieldSet::parse(payload, &[TAG_DP_ID, TAG_N_PORTS, TAG_IS_BOOTSTRAP])?;
                Ok(ProxyMessage::DatapathJoin {
                    dp_id: f.u64(TAG_DP_ID)?,
                    n_ports: f.u32(TAG_N_PORTS)?,
                    is_bootstrap: f.bool(TAG_IS_BOOTSTRAP)?,
                })
            }
            code::DATAPATH_LEAVE => {
                let f = FieldSet::parse(payload, &[TAG_DP_ID])?;
                Ok(ProxyMessage::DatapathLeave {
                    dp_id: f.u64(TAG_DP_ID)?,
                })
            }
            code::VM_MAP => {
                let f = FieldSet::parse(
                    payload,
                    &[TAG_VM_ID, TAG_VM_PORT, TAG_VS_ID, TAG_VS_PORT],
                )?;
                Ok(ProxyMessage::VmMap {
                    vm_id: f.u64(TAG_VM_ID)?,
                    vm_port: f.u32(TAG_VM_PORT)?,
                    vs_id: f.u64(TAG_VS_ID)?,
                    vs_port: f.u32(TAG_VS_PORT)?,
                })
            }
            code::DATAPATH_PORT_STATUS => {
                let f = FieldSet::parse(payload, &[TAG_DP_ID, TAG_DP_PORT, TAG_UP])?;
                Ok(ProxyMessage::DatapathPortStatus {
                    dp_id: f.u64(TAG_DP_ID)?,
                    dp_port: f.u32(TAG_DP_PORT)?,
                    up: f.bool(TAG_UP)?,
                })
            }
            code::DATA_PLANE_MAP => {
                let f = FieldSet::parse(
                    payload,
                    &[TAG_DP_ID, TAG_DP_PORT, TAG_VS_ID, TAG_VS_PORT],
                )?;
                Ok(ProxyMessage::DataPlaneMap {
                    dp_id: f.u64(TAG_DP_ID)?,
                    dp_port: f.u32(TAG_DP_PORT)?,
                    vs_id: f.u64(TAG_VS_ID)?,
                    vs_port: f.u32(TAG_VS_PORT)?,
                })
            }
            code => Err(ProtoError::UnknownType {
                family: "proxy message",
                code,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::types::MacAddress;
    use std::net::Ipv4Addr;

    fn route_directive() -> Directive {
        Directive::new(RouteModType::Add, 0x12a0a0a0a0a0)
            .with_match(Match::ipv4(
                Ipv4Addr::new(10, 1, 0, 0),
                Ipv4Addr::new(255, 255, 255, 0),
            ))
            .with_action(Action::set_eth_src(MacAddress([2, 0, 0, 0, 0, 1])))
            .with_action(Action::set_eth_dst(MacAddress([2, 0, 0, 0, 0, 2])))
            .with_action(Action::output(2))
            .with_option(FlowOption::priority(0x8000 + 24))
    }

    #[test]
    fn test_directive_layout() {
        let d = Directive::new(RouteModType::Delete, 7).with_option(FlowOption::priority(1));
        assert_eq!(
            d.encode().unwrap(),
            vec![1, 0, 0, 0, 0, 0, 0, 0, 7, 0, 0, 1, 1, 0, 1]
        );
    }

    #[test]
    fn test_directive_decode() {
        let d = route_directive();
        assert_eq!(Directive::decode(&d.encode().unwrap()).unwrap(), d);

        let msg = ClientMessage::RouteMod(d.clone());
        let back = ClientMessage::decode(msg.type_code(), &msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_directive_rejects_trailing_bytes() {
        let mut bytes = route_directive().encode().unwrap();
        bytes.push(0);
        let err = Directive::decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedField);
    }

    #[test]
    fn test_directive_rejects_unknown_field() {
        let mut bytes = vec![0];
        bytes.extend_from_slice(&5u64.to_be_bytes());
        bytes.extend_from_slice(&[1, 42, 0, 0]);
        let err = Directive::decode(&bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownField);
    }

    #[test]
    fn test_family_boundary() {
        let join = ProxyMessage::DatapathJoin {
            dp_id: 0x99,
            n_ports: 4,
            is_bootstrap: false,
        };
        let err = ClientMessage::decode(join.type_code(), &join.encode().unwrap()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownField);
        assert_eq!(
            ProxyMessage::decode(join.type_code(), &join.encode().unwrap()).unwrap(),
            join
        );
    }

    #[test]
    fn test_field_messages() {
        let msgs = vec![
            ProxyMessage::VmMap {
                vm_id: 0x12a0a0a0a0a0,
                vm_port: 1,
                vs_id: 0x99,
                vs_port: 5,
            },
            ProxyMessage::DatapathConfig {
                dp_id: 0x99,
                operation: DatapathOperation::Bgp,
            },
            ProxyMessage::DatapathPortStatus {
                dp_id: 0x99,
                dp_port: 3,
                up: false,
            },
        ];
        for msg in msgs {
            let payload = msg.encode().unwrap();
            assert_eq!(ProxyMessage::decode(msg.type_code(), &payload).unwrap(), msg);
        }

        let cfg = ClientMessage::PortConfig {
            vm_id: 1,
            vm_port: 2,
            operation: PortOperation::Reset,
        };
        let payload = cfg.encode().unwrap();
        assert_eq!(ClientMessage::decode(cfg.type_code(), &payload).unwrap(), cfg);
    }

    #[test]
    fn test_invalid_operation() {
        let payload = FieldSetWriter::new()
            .u64(TAG_DP_ID, 1)
            .u32(TAG_OPERATION, 42)
            .finish()
            .unwrap();
        let err = ProxyMessage::decode(code::DATAPATH_CONFIG, &payload).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedField);

        let err = ClientMessage::decode(code::VM_CONFIG, &[]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedField);
    }

    #[test]
    fn test_oversized_list_rejected() {
        let mut d = Directive::new(RouteModType::Add, 1);
        for port in 0..256 {
            d = d.with_action(Action::output(port));
        }
        let err = d.encode().unwrap_err();
        assert!(matches!(err, ProtoError::TooLong { actual: 256, .. }));
        assert_eq!(err.kind(), ErrorKind::MalformedField);

        let err = ProxyMessage::FlowMod(d.clone()).encode().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedField);

        d.actions.truncate(255);
        let bytes = d.encode().unwrap();
        assert_eq!(Directive::decode(&bytes).unwrap(), d);
    }
}
