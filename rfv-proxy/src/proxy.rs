//! Switch-side half of the control plane: turns host events into reports
//! for the registrar and registrar messages into OpenFlow commands.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use rfv_proto::defs::{ETH_P_LLDP, ETH_P_RFV_MAP, SERVER_ID, SERVER_PROXY_CHANNEL};
use rfv_proto::discovery;
use rfv_proto::ipc::{IpcService, MessageProcessor};
use rfv_proto::{DpId, ErrorKind, ProtoError, ProxyMessage};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::host::{ControllerHost, HostError, HostEvent};
use crate::openflow::FlowMod;
use crate::portmap::PortMap;
use crate::translator::{self, TranslateError};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Transport(#[from] ProtoError),

    #[error(transparent)]
    Host(#[from] HostError),

    #[error(transparent)]
    Translate(#[from] TranslateError),
}

impl ProxyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProxyError::Transport(e) => e.kind(),
            ProxyError::Host(e) => e.kind(),
            ProxyError::Translate(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ProxyError>;

/// What happened to a frame punted to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingress {
    /// Discovery frame, reported to the registrar.
    Mapped,
    /// Sent out of the paired port.
    Forwarded { dp_id: DpId, port: u16 },
    /// LLDP or no pairing for the ingress port.
    Dropped,
}

pub struct RfProxy {
    ipc: Arc<IpcService>,
    host: Arc<dyn ControllerHost>,
    ports: Mutex<PortMap>,
    xid: AtomicU32,
}

impl RfProxy {
    pub fn new(ipc: Arc<IpcService>, host: Arc<dyn ControllerHost>) -> Self {
        Self {
            ipc,
            host,
            ports: Mutex::new(PortMap::new()),
            xid: AtomicU32::new(1),
        }
    }

    fn next_xid(&self) -> u32 {
        self.xid.fetch_add(1, Ordering::Relaxed)
    }

    async fn report(&self, msg: ProxyMessage) -> Result<()> {
        self.ipc.send(SERVER_PROXY_CHANNEL, SERVER_ID, &msg).await?;
        Ok(())
    }

    async fn install(&self, dp_id: DpId, flow_mod: &FlowMod) -> Result<()> {
        let message = flow_mod.encode(self.next_xid()).map_err(HostError::from)?;
        self.host.send_flow_command(dp_id, message).await?;
        Ok(())
    }

    /// Processes host events until the host side goes away.
    pub async fn run(&self, mut events: mpsc::Receiver<HostEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event).await {
                warn!(kind = %e.kind(), error = %e, "Host event failed");
            }
        }
        info!("Host event stream closed");
    }

    pub async fn handle_event(&self, event: HostEvent) -> Result<()> {
        match event {
            HostEvent::DatapathJoin {
                dp_id,
                n_ports,
                is_bootstrap,
            } => {
                info!(dp_id, n_ports, is_bootstrap, "Datapath joined");
                self.report(ProxyMessage::DatapathJoin {
                    dp_id,
                    n_ports,
                    is_bootstrap,
                })
                .await
            }
            HostEvent::DatapathLeave { dp_id } => {
                let dropped = self.ports.lock().await.remove_switch(dp_id);
                info!(dp_id, dropped, "Datapath left");
                self.report(ProxyMessage::DatapathLeave { dp_id }).await
            }
            HostEvent::PacketIn {
                dp_id,
                in_port,
                payload,
            } => self.packet_in(dp_id, in_port, payload).await.map(|_| ()),
            HostEvent::PortStatus { dp_id, port, up } => {
                if !up {
                    self.ports.lock().await.remove_port((dp_id, u32::from(port)));
                }
                info!(dp_id, port, up, "Port status");
                self.report(ProxyMessage::DatapathPortStatus {
                    dp_id,
                    dp_port: u32::from(port),
                    up,
                })
                .await
            }
        }
    }

    /// Classifies a punted frame.
    pub async fn packet_in(&self, dp_id: DpId, in_port: u16, payload: Vec<u8>) -> Result<Ingress> {
        match discovery::ethertype(&payload) {
            Some(ETH_P_RFV_MAP) => {
                let Some(frame) = discovery::parse_frame(&payload) else {
                    warn!(dp_id, in_port, "Truncated mapping frame");
                    return Ok(Ingress::Dropped);
                };
                info!(
                    vm_id = frame.vm_id,
                    vm_port = frame.vm_port,
                    vs_id = dp_id,
                    vs_port = in_port,
                    "Mapping frame"
                );
                self.report(ProxyMessage::VmMap {
                    vm_id: frame.vm_id,
                    vm_port: u32::from(frame.vm_port),
                    vs_id: dp_id,
                    vs_port: u32::from(in_port),
                })
                .await?;
                return Ok(Ingress::Mapped);
            }
            Some(ETH_P_LLDP) => return Ok(Ingress::Dropped),
            _ => {}
        }

        let key = (dp_id, u32::from(in_port));
        let peer = {
            let ports = self.ports.lock().await;
            ports.lookup_dp(key).or_else(|| ports.lookup_vs(key))
        };
        let Some((out_dp, out_port)) = peer else {
            debug!(dp_id, in_port, "No port pairing, dropping frame");
            return Ok(Ingress::Dropped);
        };
        let Ok(out_port) = u16::try_from(out_port) else {
            warn!(dp_id = out_dp, port = out_port, "Paired port out of range");
            return Ok(Ingress::Dropped);
        };

        self.host.send_packet_out(out_dp, out_port, payload).await?;
        Ok(Ingress::Forwarded {
            dp_id: out_dp,
            port: out_port,
        })
    }
}

#[async_trait]
impl MessageProcessor<ProxyMessage> for RfProxy {
    async fn process(&self, _from: &str, _to: &str, _channel: &str, msg: ProxyMessage) -> bool {
        let result = match msg {
            ProxyMessage::DatapathConfig { dp_id, operation } => {
                debug!(dp_id, ?operation, "Datapath config");
                self.install(dp_id, &translator::datapath_config(operation))
                    .await
            }
            ProxyMessage::FlowMod(directive) => match translator::render(&directive) {
                Ok(flow_mod) => self.install(directive.target, &flow_mod).await,
                Err(e) => Err(e.into()),
            },
            ProxyMessage::DataPlaneMap {
                dp_id,
                dp_port,
                vs_id,
                vs_port,
            } => {
                info!(dp_id, dp_port, vs_id, vs_port, "Data plane mapped");
                self.ports
                    .lock()
                    .await
                    .insert((dp_id, dp_port), (vs_id, vs_port));
                Ok(())
            }
            other => {
                debug!(msg = ?other, "Unexpected message on proxy channel");
                return false;
            }
        };

        match result {
            Ok(()) => true,
            Err(e) => {
                warn!(kind = %e.kind(), error = %e, "Registrar message failed");
                false
            }
        }
    }
}
