//! Nudges the kernel into resolving a gateway's hardware address.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rfv_proto::Interface;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

pub const DEFAULT_PROBE_PORT: u16 = 9;
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub trait GatewayProbe: Send + Sync {
    /// Starts a best-effort resolution attempt; never blocks.
    fn probe(&self, gateway: Ipv4Addr, interface: &Interface);

    /// The gateway resolved; any attempt still in flight can stop.
    fn resolved(&self, gateway: Ipv4Addr);
}

/// Probes by opening a TCP connection to the gateway. The connection itself
/// is irrelevant; sending the SYN makes the kernel ARP for the next hop.
pub struct TcpProbe {
    port: u16,
    inflight: Mutex<HashMap<Ipv4Addr, JoinHandle<()>>>,
}

impl TcpProbe {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub fn in_flight(&self) -> usize {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        inflight.retain(|_, handle| !handle.is_finished());
        inflight.len()
    }
}

impl GatewayProbe for TcpProbe {
    fn probe(&self, gateway: Ipv4Addr, interface: &Interface) {
        let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
        if inflight.get(&gateway).is_some_and(|h| !h.is_finished()) {
            return;
        }

        let addr = SocketAddr::V4(SocketAddrV4::new(gateway, self.port));
        debug!(%gateway, interface = %interface.name, "Probing gateway");
        let handle = tokio::spawn(async move {
            match tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => trace!(%addr, "Probe connected"),
                Ok(Err(e)) => trace!(%addr, error = %e, "Probe refused"),
                Err(_) => trace!(%addr, "Probe timed out"),
            }
        });
        inflight.insert(gateway, handle);
    }

    fn resolved(&self, gateway: Ipv4Addr) {
        let handle = self
            .inflight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&gateway);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
