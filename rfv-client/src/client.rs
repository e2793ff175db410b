//! VM-side participant: registration and port state handling.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rfv_proto::defs::{CLIENT_SERVER_CHANNEL, SERVER_ID};
use rfv_proto::ipc::{IpcService, MessageProcessor};
use rfv_proto::messages::PortOperation;
use rfv_proto::{ClientMessage, VmId};
use tracing::{debug, info, warn};

use crate::flowtable::FlowTable;
use crate::mapping::MappingSender;

const REGISTER_BACKOFF_START: Duration = Duration::from_millis(100);
const REGISTER_BACKOFF_MAX: Duration = Duration::from_secs(5);

pub struct RfClient {
    vm_id: VmId,
    ipc: Arc<IpcService>,
    flows: Arc<FlowTable>,
    mapping: Arc<dyn MappingSender>,
    accepted: AtomicBool,
}

impl RfClient {
    pub fn new(ipc: Arc<IpcService>, flows: Arc<FlowTable>, mapping: Arc<dyn MappingSender>) -> Self {
        Self {
            vm_id: flows.vm_id(),
            ipc,
            flows,
            mapping,
            accepted: AtomicBool::new(false),
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    pub fn flows(&self) -> &Arc<FlowTable> {
        &self.flows
    }

    /// Whether the registrar acknowledged the registration.
    pub fn is_accepted(&self) -> bool {
        self.accepted.load(Ordering::Acquire)
    }

    /// Sends the registration request, retrying while the store is
    /// unreachable.
    pub async fn register(&self) {
        let request = ClientMessage::VmRegisterRequest { vm_id: self.vm_id };
        let mut backoff = REGISTER_BACKOFF_START;
        loop {
            match self.ipc.send(CLIENT_SERVER_CHANNEL, SERVER_ID, &request).await {
                Ok(()) => {
                    info!(vm_id = self.vm_id, "Registration sent");
                    return;
                }
                Err(e) => {
                    warn!(vm_id = self.vm_id, error = %e, ?backoff, "Registration failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(REGISTER_BACKOFF_MAX);
                }
            }
        }
    }

    /// Emits a mapping frame on every virtualized interface. Returns how many
    /// were sent.
    pub fn send_mappings(&self) -> usize {
        let mut sent = 0;
        for interface in self.flows.interfaces() {
            if interface.active && self.send_mapping(interface.port) {
                sent += 1;
            }
        }
        sent
    }

    fn send_mapping(&self, port: u32) -> bool {
        let Some(interface) = self.flows.interface_by_port(port) else {
            warn!(port, "No interface for port");
            return false;
        };
        match self.mapping.send_mapping(interface, self.vm_id) {
            Ok(()) => true,
            Err(e) => {
                warn!(interface = %interface.name, error = %e, "Mapping frame not sent");
                false
            }
        }
    }
}

#[async_trait]
impl MessageProcessor<ClientMessage> for RfClient {
    async fn process(&self, from: &str, _to: &str, _channel: &str, msg: ClientMessage) -> bool {
        match msg {
            ClientMessage::VmRegisterResponse { accept } => {
                self.accepted.store(accept, Ordering::Release);
                if accept {
                    info!(vm_id = self.vm_id, "Registration accepted");
                } else {
                    warn!(vm_id = self.vm_id, "Registration rejected");
                }
                true
            }
            ClientMessage::VmConfig { n_ports } => {
                info!(vm_id = self.vm_id, n_ports, "Configuration received");
                self.send_mappings();
                true
            }
            ClientMessage::PortConfig {
                vm_id,
                vm_port,
                operation,
            } => {
                if vm_id != self.vm_id {
                    debug!(vm_id, "Port configuration for another VM");
                    return false;
                }
                match operation {
                    PortOperation::Reset => {
                        self.flows.port_down(vm_port).await;
                        true
                    }
                    PortOperation::Map => {
                        if let Err(e) = self.flows.port_up(vm_port).await {
                            warn!(port = vm_port, kind = %e.kind(), error = %e, "Host flows not re-announced");
                        }
                        self.send_mapping(vm_port)
                    }
                }
            }
            other => {
                debug!(from, msg = ?other, "Unexpected message on client channel");
                false
            }
        }
    }
}
