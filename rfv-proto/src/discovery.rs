//! Mapping frames: the Ethernet frame a VM sends out of each interface so the
//! switch translator can learn which datapath port the interface is wired to.
//!
//! Layout: zero destination MAC, the interface MAC as source, ethertype
//! `0x0A0A`, then the VM id (u64, little-endian) and the VM port (u8).

use smoltcp::wire::{EthernetAddress, EthernetFrame, EthernetProtocol, EthernetRepr};

use crate::defs::ETH_P_RFV_MAP;
use crate::types::{MacAddress, VmId};

const PAYLOAD_LEN: usize = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingFrame {
    pub vm_id: VmId,
    pub vm_port: u8,
}

pub fn build_frame(src: MacAddress, vm_id: VmId, vm_port: u8) -> Vec<u8> {
    let repr = EthernetRepr {
        src_addr: EthernetAddress(src.octets()),
        dst_addr: EthernetAddress([0; 6]),
        ethertype: EthernetProtocol::from(ETH_P_RFV_MAP),
    };
    let mut buf = vec![0u8; repr.buffer_len() + PAYLOAD_LEN];
    let mut frame = EthernetFrame::new_unchecked(&mut buf[..]);
    repr.emit(&mut frame);
    let payload = frame.payload_mut();
    payload[..8].copy_from_slice(&vm_id.to_le_bytes());
    payload[8] = vm_port;
    buf
}

/// Ethertype of a raw frame, if it is long enough to carry one.
pub fn ethertype(data: &[u8]) -> Option<u16> {
    let frame = EthernetFrame::new_checked(data).ok()?;
    Some(u16::from(frame.ethertype()))
}

pub fn parse_frame(data: &[u8]) -> Option<MappingFrame> {
    let frame = EthernetFrame::new_checked(data).ok()?;
    if u16::from(frame.ethertype()) != ETH_P_RFV_MAP {
        return None;
    }
    let payload = frame.payload();
    if payload.len() < PAYLOAD_LEN {
        return None;
    }
    let mut id = [0u8; 8];
    id.copy_from_slice(&payload[..8]);
    Some(MappingFrame {
        vm_id: u64::from_le_bytes(id),
        vm_port: payload[8],
    })
}
