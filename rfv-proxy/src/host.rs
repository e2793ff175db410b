//! Seam between the translator and whatever speaks to the switches.

use async_trait::async_trait;
use rfv_proto::{DpId, ErrorKind};
use thiserror::Error;

use crate::openflow::OfpError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Datapath {0:#x} is not connected")]
    NotConnected(DpId),

    #[error("Connection to datapath {0:#x} closed")]
    Closed(DpId),

    #[error("OpenFlow error: {0}")]
    Protocol(#[from] OfpError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HostError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HostError::Protocol(_) => ErrorKind::MalformedField,
            _ => ErrorKind::TransportUnavailable,
        }
    }
}

/// Outbound half of a switch controller host.
#[async_trait]
pub trait ControllerHost: Send + Sync {
    /// Sends an encoded OpenFlow message to a datapath.
    async fn send_flow_command(&self, dp_id: DpId, message: Vec<u8>) -> Result<(), HostError>;

    /// Emits a frame out of one datapath port.
    async fn send_packet_out(
        &self,
        dp_id: DpId,
        port: u16,
        payload: Vec<u8>,
    ) -> Result<(), HostError>;
}

/// Inbound switch events delivered to the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    DatapathJoin {
        dp_id: DpId,
        n_ports: u32,
        is_bootstrap: bool,
    },
    DatapathLeave {
        dp_id: DpId,
    },
    PacketIn {
        dp_id: DpId,
        in_port: u16,
        payload: Vec<u8>,
    },
    PortStatus {
        dp_id: DpId,
        port: u16,
        up: bool,
    },
}
