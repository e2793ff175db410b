//! The registrar: consumes registrations and reports from VMs and the switch
//! translator, keeps the association registry and issues configuration.
//!
//! Every registry mutation happens here, one operation at a time.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use rfv_proto::defs::{CLIENT_SERVER_CHANNEL, PROXY_ID, SERVER_PROXY_CHANNEL, vm_participant};
use rfv_proto::ipc::{IpcService, MessageProcessor};
use rfv_proto::messages::{DatapathOperation, PortOperation};
use rfv_proto::tlv::ActionType;
use rfv_proto::{
    Action, ClientMessage, Directive, DpId, ErrorKind, ProtoError, ProxyMessage, VmId,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::registry::{AssociationRecord, FieldFilter, RecordQuery, Registry, RegistryError};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Transport(#[from] ProtoError),
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::Registry(e) => e.kind(),
            ServerError::Transport(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;

/// Outcome of a VM registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmRegistration {
    /// First registration, paired with an idle datapath.
    Paired(DpId),
    /// First registration, no datapath free yet.
    Idle,
    /// The VM was known; its mapping was reset and will be re-learned.
    Restored,
}

/// Outcome of a datapath registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatapathRegistration {
    Paired(VmId),
    Idle,
    Restored,
    Bootstrap,
}

pub struct RfServer {
    ipc: Arc<IpcService>,
    registry: Registry,
    op_lock: Mutex<()>,
}

impl RfServer {
    pub fn new(ipc: Arc<IpcService>, registry: Registry) -> Self {
        Self {
            ipc,
            registry,
            op_lock: Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub async fn register_vm(&self, vm_id: VmId) -> Result<VmRegistration> {
        let _guard = self.op_lock.lock().await;

        let existing = self.registry.get_entries(&RecordQuery::vm(vm_id)).await?;
        let outcome = if existing.is_empty() {
            let idle = self
                .registry
                .get_entries(&RecordQuery {
                    dp_id: FieldFilter::Present,
                    vm_id: FieldFilter::Empty,
                    ..Default::default()
                })
                .await?;

            match idle.first().and_then(|r| r.dp_id) {
                Some(dp_id) => {
                    let claimed = self.registry.claim_idle_datapath(dp_id, vm_id).await?;
                    info!(vm_id, dp_id, ports = claimed, "VM paired with idle datapath");
                    VmRegistration::Paired(dp_id)
                }
                None => {
                    self.registry
                        .set_entry(&AssociationRecord::for_vm(vm_id))
                        .await?;
                    info!(vm_id, "No idle datapath, VM registered as idle");
                    VmRegistration::Idle
                }
            }
        } else {
            self.registry.reset_mapping_for_vm(vm_id).await?;
            let dps: BTreeSet<DpId> = existing.iter().filter_map(|r| r.dp_id).collect();
            for dp_id in &dps {
                self.configure_datapath(*dp_id).await?;
            }
            info!(vm_id, datapaths = dps.len(), "VM already registered, mapping reset");
            VmRegistration::Restored
        };

        self.ipc
            .send(
                CLIENT_SERVER_CHANNEL,
                &vm_participant(vm_id),
                &ClientMessage::VmRegisterResponse { accept: true },
            )
            .await?;

        if outcome != VmRegistration::Idle {
            self.configure_vm(vm_id).await?;
        }
        Ok(outcome)
    }

    pub async fn register_datapath(
        &self,
        dp_id: DpId,
        n_ports: u32,
        is_bootstrap: bool,
    ) -> Result<DatapathRegistration> {
        let _guard = self.op_lock.lock().await;

        self.configure_datapath(dp_id).await?;

        if is_bootstrap {
            self.send_datapath_config(dp_id, DatapathOperation::ForwardAll)
                .await?;
            info!(dp_id, "Bootstrap datapath configured");
            return Ok(DatapathRegistration::Bootstrap);
        }

        let existing = self.registry.get_entries(&RecordQuery::datapath(dp_id)).await?;
        if !existing.is_empty() {
            let vms: BTreeSet<VmId> = existing
                .iter()
                .filter(|r| !r.is_mapped())
                .filter_map(|r| r.vm_id)
                .collect();
            for vm_id in &vms {
                self.configure_vm(*vm_id).await?;
            }
            info!(dp_id, vms = vms.len(), "Datapath already registered, association restored");
            return Ok(DatapathRegistration::Restored);
        }

        let idle = self
            .registry
            .get_entries(&RecordQuery {
                vm_id: FieldFilter::Present,
                dp_id: FieldFilter::Empty,
                ..Default::default()
            })
            .await?;

        match idle.first() {
            Some(placeholder) => {
                let vm_id = placeholder.vm_id.unwrap_or_default();
                for _ in 0..n_ports {
                    self.registry
                        .set_entry(&AssociationRecord::for_datapath(dp_id, Some(vm_id)))
                        .await?;
                }
                self.registry.remove_entry(&placeholder.id).await?;
                self.configure_vm(vm_id).await?;
                info!(dp_id, vm_id, n_ports, "Datapath paired with idle VM");
                Ok(DatapathRegistration::Paired(vm_id))
            }
            None => {
                for _ in 0..n_ports {
                    self.registry
                        .set_entry(&AssociationRecord::for_datapath(dp_id, None))
                        .await?;
                }
                info!(dp_id, n_ports, "No idle VM, datapath registered as idle");
                Ok(DatapathRegistration::Idle)
            }
        }
    }

    /// Forgets port mappings of a departed datapath, keeping its pairing.
    pub async fn datapath_leave(&self, dp_id: DpId) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let reset = self.registry.reset_mapping_for_dp(dp_id).await?;
        info!(dp_id, records = reset, "Datapath left");
        Ok(())
    }

    /// Forwards a VM's route report to the datapath bound to it. Returns
    /// false when the VM has no datapath yet.
    pub async fn route_mod(&self, mut directive: Directive) -> Result<bool> {
        let vm_id = directive.target;
        let records = self.registry.get_entries(&RecordQuery::vm(vm_id)).await?;

        let Some(dp_id) = records.iter().find_map(|r| r.dp_id) else {
            debug!(vm_id, "Route report from unpaired VM dropped");
            return Ok(false);
        };

        for action in directive.actions.iter_mut() {
            if action.kind() != ActionType::Output {
                continue;
            }
            let Some(vm_port) = action.as_u32() else {
                continue;
            };
            let mapped = records
                .iter()
                .find(|r| r.vm_port == Some(vm_port) && r.is_mapped());
            if let Some(dp_port) = mapped.and_then(|r| r.dp_port) {
                *action = Action::output(dp_port);
            }
        }

        directive.target = dp_id;
        self.ipc
            .send(SERVER_PROXY_CHANNEL, PROXY_ID, &ProxyMessage::FlowMod(directive))
            .await?;
        Ok(true)
    }

    /// Records a learned VM port ↔ switch port mapping. A report for a VM
    /// port that is already mapped to the same switch port is discarded; one
    /// naming a different switch port rebinds that record.
    pub async fn map_vm(
        &self,
        vm_id: VmId,
        vm_port: u32,
        vs_id: DpId,
        vs_port: u32,
    ) -> Result<bool> {
        let _guard = self.op_lock.lock().await;

        let mapped = self
            .registry
            .get_entries(&RecordQuery {
                vm_port: FieldFilter::Eq(vm_port),
                vs_id: FieldFilter::Present,
                ..RecordQuery::vm(vm_id)
            })
            .await?;
        if let Some(existing) = mapped.first() {
            if existing.vs_id == Some(vs_id) && existing.vs_port == Some(vs_port) {
                debug!(vm_id, vm_port, vs_id, vs_port, "Duplicate mapping report");
                return Ok(false);
            }
            let mut record = existing.clone();
            record.vs_id = Some(vs_id);
            record.vs_port = Some(vs_port);
            self.registry.set_entry(&record).await?;
            info!(vm_id, vm_port, vs_id, vs_port, "VM port remapped");
            self.announce_mapping(&record).await?;
            return Ok(true);
        }

        let unmapped = self
            .registry
            .get_entries(&RecordQuery {
                vs_id: FieldFilter::Empty,
                ..RecordQuery::vm(vm_id)
            })
            .await?;

        let Some(record) = unmapped.first() else {
            warn!(vm_id, vm_port, "Mapping report without an unmapped record");
            return Ok(false);
        };

        // VM port N is wired to datapath port N.
        let dp_port = vm_port;
        if !self
            .registry
            .fill_mapping(&record.id, vm_port, vs_id, vs_port, dp_port)
            .await?
        {
            return Ok(false);
        }
        info!(vm_id, vm_port, vs_id, vs_port, "VM port mapped");

        let record = AssociationRecord {
            vm_port: Some(vm_port),
            vs_id: Some(vs_id),
            vs_port: Some(vs_port),
            dp_port: Some(dp_port),
            ..record.clone()
        };
        self.announce_mapping(&record).await?;
        Ok(true)
    }

    /// Hands a mapped record's switch port pairing to the translator.
    async fn announce_mapping(&self, record: &AssociationRecord) -> Result<()> {
        let (Some(dp_id), Some(dp_port), Some(vs_id), Some(vs_port)) =
            (record.dp_id, record.dp_port, record.vs_id, record.vs_port)
        else {
            return Ok(());
        };
        self.ipc
            .send(
                SERVER_PROXY_CHANNEL,
                PROXY_ID,
                &ProxyMessage::DataPlaneMap {
                    dp_id,
                    dp_port,
                    vs_id,
                    vs_port,
                },
            )
            .await?;
        Ok(())
    }

    /// Tells the VM behind a datapath port that the port went down or up.
    pub async fn datapath_port_status(&self, dp_id: DpId, dp_port: u32, up: bool) -> Result<()> {
        let _guard = self.op_lock.lock().await;

        if up {
            let paired = self
                .registry
                .get_entries(&RecordQuery {
                    vm_id: FieldFilter::Present,
                    ..RecordQuery::datapath(dp_id)
                })
                .await?;
            let already_mapped = paired.iter().any(|r| r.dp_port == Some(dp_port));
            if let (Some(vm_id), false) = (paired.first().and_then(|r| r.vm_id), already_mapped) {
                self.send_port_config(vm_id, dp_port, PortOperation::Map)
                    .await?;
            }
            return Ok(());
        }

        let affected = self
            .registry
            .get_entries(&RecordQuery {
                dp_port: FieldFilter::Eq(dp_port),
                ..RecordQuery::datapath(dp_id)
            })
            .await?;
        self.registry
            .reset_mapping_for_dp_port(dp_id, dp_port)
            .await?;
        for record in affected {
            if let (Some(vm_id), Some(vm_port)) = (record.vm_id, record.vm_port) {
                self.send_port_config(vm_id, vm_port, PortOperation::Reset)
                    .await?;
            }
        }
        Ok(())
    }

    async fn configure_vm(&self, vm_id: VmId) -> Result<()> {
        let n_ports = self
            .registry
            .get_entries(&RecordQuery {
                dp_id: FieldFilter::Present,
                ..RecordQuery::vm(vm_id)
            })
            .await?
            .len();
        self.ipc
            .send(
                CLIENT_SERVER_CHANNEL,
                &vm_participant(vm_id),
                &ClientMessage::VmConfig {
                    n_ports: n_ports as u32,
                },
            )
            .await?;
        info!(vm_id, n_ports, "Configuration sent to VM");
        Ok(())
    }

    async fn configure_datapath(&self, dp_id: DpId) -> Result<()> {
        for operation in DatapathOperation::BASE {
            self.send_datapath_config(dp_id, operation).await?;
        }
        Ok(())
    }

    async fn send_datapath_config(&self, dp_id: DpId, operation: DatapathOperation) -> Result<()> {
        self.ipc
            .send(
                SERVER_PROXY_CHANNEL,
                PROXY_ID,
                &ProxyMessage::DatapathConfig { dp_id, operation },
            )
            .await?;
        Ok(())
    }

    async fn send_port_config(
        &self,
        vm_id: VmId,
        vm_port: u32,
        operation: PortOperation,
    ) -> Result<()> {
        self.ipc
            .send(
                CLIENT_SERVER_CHANNEL,
                &vm_participant(vm_id),
                &ClientMessage::PortConfig {
                    vm_id,
                    vm_port,
                    operation,
                },
            )
            .await?;
        info!(vm_id, vm_port, ?operation, "Port configuration sent to VM");
        Ok(())
    }
}

fn log_failure(what: &str, result: Result<()>) -> bool {
    match result {
        Ok(()) => true,
        Err(e) => {
            warn!(kind = %e.kind(), error = %e, "{what} failed");
            false
        }
    }
}

#[async_trait]
impl MessageProcessor<ClientMessage> for RfServer {
    async fn process(&self, from: &str, _to: &str, _channel: &str, msg: ClientMessage) -> bool {
        match msg {
            ClientMessage::VmRegisterRequest { vm_id } => {
                info!(vm_id, "Register request");
                log_failure("VM registration", self.register_vm(vm_id).await.map(|_| ()))
            }
            ClientMessage::RouteMod(directive) => {
                debug!(from, %directive, "Route report");
                match self.route_mod(directive).await {
                    Ok(forwarded) => forwarded,
                    Err(e) => log_failure("Route report", Err(e)),
                }
            }
            other => {
                debug!(from, msg = ?other, "Unexpected message on client channel");
                false
            }
        }
    }
}

#[async_trait]
impl MessageProcessor<ProxyMessage> for RfServer {
    async fn process(&self, _from: &str, _to: &str, _channel: &str, msg: ProxyMessage) -> bool {
        match msg {
            ProxyMessage::DatapathJoin {
                dp_id,
                n_ports,
                is_bootstrap,
            } => log_failure(
                "Datapath registration",
                self.register_datapath(dp_id, n_ports, is_bootstrap)
                    .await
                    .map(|_| ()),
            ),
            ProxyMessage::DatapathLeave { dp_id } => {
                log_failure("Datapath leave", self.datapath_leave(dp_id).await)
            }
            ProxyMessage::VmMap {
                vm_id,
                vm_port,
                vs_id,
                vs_port,
            } => match self.map_vm(vm_id, vm_port, vs_id, vs_port).await {
                Ok(mapped) => mapped,
                Err(e) => log_failure("VM mapping", Err(e)),
            },
            ProxyMessage::DatapathPortStatus { dp_id, dp_port, up } => log_failure(
                "Port status",
                self.datapath_port_status(dp_id, dp_port, up).await,
            ),
            other => {
                debug!(msg = ?other, "Unexpected message on proxy channel");
                false
            }
        }
    }
}
