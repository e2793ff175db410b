//! OpenFlow 1.0 controller host over TCP.
//!
//! Each switch connection gets a reader loop and a writer task fed by an
//! mpsc queue. Once the features reply names the datapath, the writer is
//! registered under its id and a join event is emitted; end of stream
//! unregisters it and emits a leave.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use rfv_proto::DpId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::host::{ControllerHost, HostError, HostEvent};
use crate::openflow::{self, OFP_HEADER_LEN, OfpHeader, PacketOut, SwitchFeatures, SwitchMessage};

const WRITE_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 1024;

pub struct OfHost {
    switches: RwLock<HashMap<DpId, mpsc::Sender<Vec<u8>>>>,
    events: mpsc::Sender<HostEvent>,
    bootstrap_dpid: Option<DpId>,
    xid: AtomicU32,
}

impl OfHost {
    /// Creates the host and the stream of events it produces.
    pub fn new(bootstrap_dpid: Option<DpId>) -> (Arc<Self>, mpsc::Receiver<HostEvent>) {
        let (events, rx) = mpsc::channel(EVENT_QUEUE);
        let host = Arc::new(Self {
            switches: RwLock::new(HashMap::new()),
            events,
            bootstrap_dpid,
            xid: AtomicU32::new(1),
        });
        (host, rx)
    }

    fn next_xid(&self) -> u32 {
        self.xid.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn connected(&self) -> Vec<DpId> {
        let mut ids: Vec<_> = self.switches.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Accepts switch connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "OpenFlow listener started");
        loop {
            let (stream, peer) = listener.accept().await?;
            if let Err(e) = stream.set_nodelay(true) {
                debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
            }
            let host = Arc::clone(&self);
            tokio::spawn(async move {
                info!(%peer, "Switch connected");
                if let Err(e) = host.handle_connection(stream).await {
                    warn!(%peer, error = %e, "Switch connection failed");
                }
                info!(%peer, "Switch disconnected");
            });
        }
    }

    /// Runs one switch connection to completion.
    pub async fn handle_connection<S>(&self, stream: S) -> Result<(), HostError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(WRITE_QUEUE);

        let writer_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = writer.write_all(&message).await {
                    debug!(error = %e, "Switch write failed");
                    break;
                }
            }
        });

        let mut joined = None;
        let result = self.read_loop(&mut reader, &tx, &mut joined).await;

        if let Some(dp_id) = joined {
            let removed = {
                let mut switches = self.switches.write().await;
                // A reconnect may already have replaced this writer.
                match switches.get(&dp_id) {
                    Some(current) if current.same_channel(&tx) => {
                        switches.remove(&dp_id);
                        true
                    }
                    _ => false,
                }
            };
            if removed {
                self.emit(HostEvent::DatapathLeave { dp_id }).await;
            }
        }

        drop(tx);
        let _ = writer_task.await;
        result
    }

    async fn read_loop<R>(
        &self,
        reader: &mut R,
        tx: &mpsc::Sender<Vec<u8>>,
        joined: &mut Option<DpId>,
    ) -> Result<(), HostError>
    where
        R: AsyncRead + Unpin,
    {
        let send = |message: Vec<u8>| async move {
            tx.send(message)
                .await
                .map_err(|_| HostError::Io(std::io::ErrorKind::BrokenPipe.into()))
        };

        send(openflow::hello(self.next_xid())?).await?;
        send(openflow::features_request(self.next_xid())?).await?;

        let mut raw = [0u8; OFP_HEADER_LEN];
        loop {
            match reader.read_exact(&mut raw).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            let header = OfpHeader::parse(&raw)?;
            let mut body = vec![0u8; header.body_len()];
            reader.read_exact(&mut body).await?;

            let message = match SwitchMessage::parse(&header, &body) {
                Ok(message) => message,
                Err(e) => {
                    warn!(kind = header.kind, error = %e, "Dropping malformed switch message");
                    continue;
                }
            };

            match message {
                SwitchMessage::EchoRequest(payload) => {
                    send(openflow::echo_reply(header.xid, &payload)?).await?;
                }
                SwitchMessage::FeaturesReply(features) => {
                    let dp_id = features.datapath_id;
                    self.switches.write().await.insert(dp_id, tx.clone());
                    *joined = Some(dp_id);
                    self.emit(self.join_event(&features)).await;
                }
                SwitchMessage::PacketIn(packet) => {
                    if let Some(dp_id) = *joined {
                        self.emit(HostEvent::PacketIn {
                            dp_id,
                            in_port: packet.in_port,
                            payload: packet.data,
                        })
                        .await;
                    }
                }
                SwitchMessage::PortStatus(status) => {
                    match *joined {
                        Some(dp_id) if status.desc.is_physical() => {
                            self.emit(HostEvent::PortStatus {
                                dp_id,
                                port: status.desc.port_no,
                                up: status.is_up(),
                            })
                            .await;
                        }
                        _ => {}
                    }
                }
                SwitchMessage::Error { err_type, code } => {
                    warn!(dp_id = ?joined, err_type, code, "Switch reported an error");
                }
                SwitchMessage::Hello | SwitchMessage::EchoReply | SwitchMessage::Other(_) => {
                    debug!(kind = header.kind, "Ignoring switch message");
                }
            }
        }
    }

    fn join_event(&self, features: &SwitchFeatures) -> HostEvent {
        let n_ports = features.ports.iter().filter(|p| p.is_physical()).count();
        HostEvent::DatapathJoin {
            dp_id: features.datapath_id,
            n_ports: n_ports as u32,
            is_bootstrap: self.bootstrap_dpid == Some(features.datapath_id),
        }
    }

    async fn emit(&self, event: HostEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Host event receiver gone");
        }
    }

    async fn writer_for(&self, dp_id: DpId) -> Result<mpsc::Sender<Vec<u8>>, HostError> {
        self.switches
            .read()
            .await
            .get(&dp_id)
            .cloned()
            .ok_or(HostError::NotConnected(dp_id))
    }
}

#[async_trait]
impl ControllerHost for OfHost {
    async fn send_flow_command(&self, dp_id: DpId, message: Vec<u8>) -> Result<(), HostError> {
        let writer = self.writer_for(dp_id).await?;
        writer
            .send(message)
            .await
            .map_err(|_| HostError::Closed(dp_id))
    }

    async fn send_packet_out(
        &self,
        dp_id: DpId,
        port: u16,
        payload: Vec<u8>,
    ) -> Result<(), HostError> {
        let writer = self.writer_for(dp_id).await?;
        let message = PacketOut::to_port(port, payload).encode(self.next_xid())?;
        writer
            .send(message)
            .await
            .map_err(|_| HostError::Closed(dp_id))
    }
}
