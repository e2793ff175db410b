//! Type-length-value fields carried by route and flow directives.
//!
//! A field is a type code plus a value whose length is fixed by the type.
//! Scalars are kept in host order in memory and converted to network order
//! on the wire; addresses and MACs are network order everywhere. The most
//! significant bit of a type code marks the field optional: a renderer that
//! cannot express an optional field may drop it, a mandatory one aborts.

use std::borrow::Cow;
use std::fmt;
use std::hash::Hash;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::{ProtoError, Result};
use crate::types::MacAddress;
use crate::wire::WireReader;

const OPTIONAL_BIT: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    Host,
    Network,
}

/// How a value is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueFormat {
    Empty,
    Scalar,
    Mac,
    Ipv4Pair,
    Ipv6Pair,
}

/// A closed set of type codes for one field family.
pub trait TlvType: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    const FAMILY: &'static str;

    fn code(self) -> u8;
    fn from_code(code: u8) -> Option<Self>;
    fn name(self) -> &'static str;
    fn length(self) -> usize;
    fn byte_order(self) -> ByteOrder;
    fn value_format(self) -> ValueFormat;

    fn is_optional(self) -> bool {
        self.code() & OPTIONAL_BIT != 0
    }
}

macro_rules! tlv_type {
    (
        $(#[$meta:meta])*
        $name:ident, $family:literal {
            $($variant:ident = $code:literal, $label:literal, $len:literal, $order:ident, $fmt:ident;)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($variant = $code,)+
        }

        impl TlvType for $name {
            const FAMILY: &'static str = $family;

            fn code(self) -> u8 {
                self as u8
            }

            fn from_code(code: u8) -> Option<Self> {
                match code {
                    $($code => Some($name::$variant),)+
                    _ => None,
                }
            }

            fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }

            fn length(self) -> usize {
                match self {
                    $($name::$variant => $len,)+
                }
            }

            fn byte_order(self) -> ByteOrder {
                match self {
                    $($name::$variant => ByteOrder::$order,)+
                }
            }

            fn value_format(self) -> ValueFormat {
                match self {
                    $($name::$variant => ValueFormat::$fmt,)+
                }
            }
        }
    };
}

tlv_type! {
    /// Packet header fields a flow can match on.
    MatchType, "match" {
        Ipv4 = 1, "ipv4", 8, Network, Ipv4Pair;
        Ipv6 = 2, "ipv6", 32, Network, Ipv6Pair;
        Ethernet = 3, "ethernet", 6, Network, Mac;
        Mpls = 4, "mpls", 4, Host, Scalar;
        Ethertype = 5, "ethertype", 2, Host, Scalar;
        NwProto = 6, "nw_proto", 1, Host, Scalar;
        TpSrc = 7, "tp_src", 2, Host, Scalar;
        TpDst = 8, "tp_dst", 2, Host, Scalar;
        InPort = 254, "in_port", 4, Host, Scalar;
        Vlan = 255, "vlan", 2, Host, Scalar;
    }
}

tlv_type! {
    /// Forwarding behaviours applied to matching packets.
    ActionType, "action" {
        Output = 1, "output", 4, Host, Scalar;
        SetEthSrc = 2, "set_eth_src", 6, Network, Mac;
        SetEthDst = 3, "set_eth_dst", 6, Network, Mac;
        PushMpls = 4, "push_mpls", 4, Host, Scalar;
        PopMpls = 5, "pop_mpls", 0, Host, Empty;
        SwapMpls = 6, "swap_mpls", 4, Host, Scalar;
        Drop = 254, "drop", 0, Host, Empty;
        Sflow = 255, "sflow", 0, Host, Empty;
    }
}

tlv_type! {
    /// Flow entry parameters that are neither matches nor actions.
    OptionType, "option" {
        Priority = 1, "priority", 2, Host, Scalar;
        IdleTimeout = 2, "idle_timeout", 2, Host, Scalar;
        HardTimeout = 3, "hard_timeout", 2, Host, Scalar;
        CtId = 255, "ct_id", 8, Host, Scalar;
    }
}

/// An immutable TLV field. Equality compares type and value bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field<T: TlvType> {
    kind: T,
    value: Box<[u8]>,
}

pub type Match = Field<MatchType>;
pub type Action = Field<ActionType>;
pub type FlowOption = Field<OptionType>;

/// Converts a host-order scalar to or from network order. Both directions
/// are the same byte reversal on little-endian hosts.
fn flip(order: ByteOrder, value: &[u8]) -> Cow<'_, [u8]> {
    if order == ByteOrder::Host && cfg!(target_endian = "little") && value.len() > 1 {
        let mut owned = value.to_vec();
        owned.reverse();
        Cow::Owned(owned)
    } else {
        Cow::Borrowed(value)
    }
}

impl<T: TlvType> Field<T> {
    /// Copies `value`, which must have the length the type demands.
    pub fn from_raw(kind: T, value: &[u8]) -> Result<Self> {
        if value.len() != kind.length() {
            return Err(ProtoError::Length {
                what: format!("{} {}", T::FAMILY, kind.name()),
                expected: kind.length(),
                actual: value.len(),
            });
        }
        Ok(Self {
            kind,
            value: value.into(),
        })
    }

    pub fn from_u8(kind: T, value: u8) -> Result<Self> {
        Self::from_raw(kind, &[value])
    }

    pub fn from_u16(kind: T, value: u16) -> Result<Self> {
        Self::from_raw(kind, &value.to_ne_bytes())
    }

    pub fn from_u32(kind: T, value: u32) -> Result<Self> {
        Self::from_raw(kind, &value.to_ne_bytes())
    }

    pub fn from_u64(kind: T, value: u64) -> Result<Self> {
        Self::from_raw(kind, &value.to_ne_bytes())
    }

    pub fn from_mac(kind: T, mac: MacAddress) -> Result<Self> {
        Self::from_raw(kind, &mac.octets())
    }

    pub fn from_ipv4(kind: T, addr: Ipv4Addr, mask: Ipv4Addr) -> Result<Self> {
        let mut value = [0u8; 8];
        value[..4].copy_from_slice(&addr.octets());
        value[4..].copy_from_slice(&mask.octets());
        Self::from_raw(kind, &value)
    }

    pub fn from_ipv6(kind: T, addr: Ipv6Addr, mask: Ipv6Addr) -> Result<Self> {
        let mut value = [0u8; 32];
        value[..16].copy_from_slice(&addr.octets());
        value[16..].copy_from_slice(&mask.octets());
        Self::from_raw(kind, &value)
    }

    /// Builds a field from its wire form, as found in a received message.
    pub fn from_wire(code: u8, value: &[u8]) -> Result<Self> {
        let kind = T::from_code(code).ok_or(ProtoError::UnknownType {
            family: T::FAMILY,
            code: u32::from(code),
        })?;
        Self::from_raw(kind, &flip(kind.byte_order(), value))
    }

    pub fn kind(&self) -> T {
        self.kind
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }

    pub fn is_optional(&self) -> bool {
        self.kind.is_optional()
    }

    pub fn as_u8(&self) -> Option<u8> {
        match *self.value {
            [b] => Some(b),
            _ => None,
        }
    }

    pub fn as_u16(&self) -> Option<u16> {
        Some(u16::from_ne_bytes(self.value.as_ref().try_into().ok()?))
    }

    pub fn as_u32(&self) -> Option<u32> {
        Some(u32::from_ne_bytes(self.value.as_ref().try_into().ok()?))
    }

    pub fn as_u64(&self) -> Option<u64> {
        Some(u64::from_ne_bytes(self.value.as_ref().try_into().ok()?))
    }

    pub fn as_mac(&self) -> Option<MacAddress> {
        let octets: [u8; 6] = self.value.as_ref().try_into().ok()?;
        Some(MacAddress(octets))
    }

    /// Address and mask of an IPv4 pair.
    pub fn as_ipv4(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        if self.value.len() != 8 {
            return None;
        }
        let addr: [u8; 4] = self.value[..4].try_into().ok()?;
        let mask: [u8; 4] = self.value[4..].try_into().ok()?;
        Some((Ipv4Addr::from(addr), Ipv4Addr::from(mask)))
    }

    pub fn as_ipv6(&self) -> Option<(Ipv6Addr, Ipv6Addr)> {
        if self.value.len() != 32 {
            return None;
        }
        let addr: [u8; 16] = self.value[..16].try_into().ok()?;
        let mask: [u8; 16] = self.value[16..].try_into().ok()?;
        Some((Ipv6Addr::from(addr), Ipv6Addr::from(mask)))
    }

    /// Appends `{type: u8, value}` with the value in network order.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.kind.code());
        out.extend_from_slice(&flip(self.kind.byte_order(), &self.value));
    }

    pub fn decode(reader: &mut WireReader<'_>) -> Result<Self> {
        let code = reader.u8(T::FAMILY)?;
        let kind = T::from_code(code).ok_or(ProtoError::UnknownType {
            family: T::FAMILY,
            code: u32::from(code),
        })?;
        let value = reader.take(kind.length(), kind.name())?;
        Self::from_raw(kind, &flip(kind.byte_order(), value))
    }

    fn scalar(&self) -> u64 {
        match self.value.len() {
            1 => self.as_u8().map(u64::from),
            2 => self.as_u16().map(u64::from),
            4 => self.as_u32().map(u64::from),
            8 => self.as_u64(),
            _ => None,
        }
        .unwrap_or_default()
    }
}

impl<T: TlvType> fmt::Display for Field<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = self.kind.name();
        match self.kind.value_format() {
            ValueFormat::Empty => write!(f, "{name}"),
            ValueFormat::Scalar => write!(f, "{name}={}", self.scalar()),
            ValueFormat::Mac => match self.as_mac() {
                Some(mac) => write!(f, "{name}={mac}"),
                None => write!(f, "{name}=?"),
            },
            ValueFormat::Ipv4Pair => match self.as_ipv4() {
                Some((addr, mask)) => write!(f, "{name}={addr}/{mask}"),
                None => write!(f, "{name}=?"),
            },
            ValueFormat::Ipv6Pair => match self.as_ipv6() {
                Some((addr, mask)) => write!(f, "{name}={addr}/{mask}"),
                None => write!(f, "{name}=?"),
            },
        }
    }
}

// Constructors for the common fields. Widths are fixed by the type, so these
// cannot fail.

impl<T: TlvType> Field<T> {
    fn fixed(kind: T, value: &[u8]) -> Self {
        debug_assert_eq!(value.len(), kind.length());
        Self {
            kind,
            value: value.into(),
        }
    }
}

impl Match {
    pub fn ipv4(addr: Ipv4Addr, mask: Ipv4Addr) -> Self {
        let mut value = [0u8; 8];
        value[..4].copy_from_slice(&addr.octets());
        value[4..].copy_from_slice(&mask.octets());
        Self::fixed(MatchType::Ipv4, &value)
    }

    pub fn ethernet(mac: MacAddress) -> Self {
        Self::fixed(MatchType::Ethernet, &mac.octets())
    }

    pub fn ethertype(ethertype: u16) -> Self {
        Self::fixed(MatchType::Ethertype, &ethertype.to_ne_bytes())
    }

    pub fn nw_proto(proto: u8) -> Self {
        Self::fixed(MatchType::NwProto, &[proto])
    }

    pub fn tp_src(port: u16) -> Self {
        Self::fixed(MatchType::TpSrc, &port.to_ne_bytes())
    }

    pub fn tp_dst(port: u16) -> Self {
        Self::fixed(MatchType::TpDst, &port.to_ne_bytes())
    }

    pub fn in_port(port: u32) -> Self {
        Self::fixed(MatchType::InPort, &port.to_ne_bytes())
    }
}

impl Action {
    pub fn output(port: u32) -> Self {
        Self::fixed(ActionType::Output, &port.to_ne_bytes())
    }

    pub fn set_eth_src(mac: MacAddress) -> Self {
        Self::fixed(ActionType::SetEthSrc, &mac.octets())
    }

    pub fn set_eth_dst(mac: MacAddress) -> Self {
        Self::fixed(ActionType::SetEthDst, &mac.octets())
    }
}

impl FlowOption {
    pub fn priority(priority: u16) -> Self {
        Self::fixed(OptionType::Priority, &priority.to_ne_bytes())
    }

    pub fn idle_timeout(seconds: u16) -> Self {
        Self::fixed(OptionType::IdleTimeout, &seconds.to_ne_bytes())
    }

    pub fn hard_timeout(seconds: u16) -> Self {
        Self::fixed(OptionType::HardTimeout, &seconds.to_ne_bytes())
    }
}
