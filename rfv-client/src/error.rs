use std::net::Ipv4Addr;

use rfv_proto::{ErrorKind, ProtoError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] ProtoError),

    #[error(transparent)]
    Kernel(#[from] crate::kernel::KernelError),

    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    #[error("Gateway {0} unresolved")]
    UnresolvedGateway(Ipv4Addr),

    #[error("System error: {0}")]
    Nix(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ClientError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport(e) => e.kind(),
            ClientError::UnresolvedGateway(_) => ErrorKind::UnresolvedGateway,
            _ => ErrorKind::TransportUnavailable,
        }
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
