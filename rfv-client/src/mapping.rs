//! Emits the discovery frame that tells the switch translator which VM port
//! sits behind a virtual switch port.

use std::os::fd::AsRawFd;

use rfv_proto::defs::ETH_P_RFV_MAP;
use rfv_proto::discovery;
use rfv_proto::{Interface, VmId};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::interfaces::interface_index;

pub trait MappingSender: Send + Sync {
    fn send_mapping(&self, interface: &Interface, vm_id: VmId) -> Result<()>;
}

/// Builds the mapping frame for `interface`, or `None` when its port number
/// does not fit the frame's single-byte port field.
pub fn mapping_frame(interface: &Interface, vm_id: VmId) -> Option<Vec<u8>> {
    let port = u8::try_from(interface.port).ok()?;
    Some(discovery::build_frame(interface.hwaddress, vm_id, port))
}

/// Sends mapping frames through an `AF_PACKET` raw socket.
pub struct RawMappingSender {
    socket: Socket,
}

impl RawMappingSender {
    pub fn new() -> Result<Self> {
        let socket = Socket::new(
            Domain::PACKET,
            Type::RAW,
            Some(Protocol::from(i32::from(ETH_P_RFV_MAP.to_be()))),
        )?;
        Ok(Self { socket })
    }
}

impl MappingSender for RawMappingSender {
    fn send_mapping(&self, interface: &Interface, vm_id: VmId) -> Result<()> {
        let if_index = interface_index(&interface.name)
            .ok_or_else(|| ClientError::InterfaceNotFound(interface.name.clone()))?;
        let Some(frame) = mapping_frame(interface, vm_id) else {
            warn!(
                interface = %interface.name,
                port = interface.port,
                "Port number out of mapping range, skipped"
            );
            return Ok(());
        };

        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETH_P_RFV_MAP.to_be();
        addr.sll_ifindex = if_index as i32;
        addr.sll_halen = 6;

        let ret = unsafe {
            libc::sendto(
                self.socket.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        debug!(
            interface = %interface.name,
            port = interface.port,
            vm_id,
            "Mapping frame sent"
        );
        Ok(())
    }
}
