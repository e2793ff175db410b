//! Per-VM flow table synchronizer.
//!
//! Three loops share one [`FlowTable`]: the host loop applies neighbor
//! changes and announces host flows, the route loop queues route changes,
//! and the [`Resolver`] installs queued routes once their gateway's
//! hardware address is known. The resolver is the only writer of the
//! installed route list.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rfv_proto::defs::{CLIENT_SERVER_CHANNEL, SERVER_ID};
use rfv_proto::ipc::IpcService;
use rfv_proto::{ClientMessage, Directive, Interface, VmId};
use tokio::sync::{Notify, RwLock, mpsc};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::kernel::{NeighborEvent, RouteEvent};
use crate::probe::GatewayProbe;
use crate::queue::PendingQueue;
use crate::tables::{HostEntry, PendingRoute, RouteEntry, RouteOp};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Pause after a route had to be requeued.
    pub retry_interval: Duration,
    /// Attempts before an unresolved route is dropped; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_attempts: None,
        }
    }
}

/// State shared by the synchronizer loops of one VM.
pub struct FlowTable {
    vm_id: VmId,
    ipc: Arc<IpcService>,
    interfaces: HashMap<String, Interface>,
    hosts: RwLock<HashMap<Ipv4Addr, HostEntry>>,
    down_ports: RwLock<HashSet<u32>>,
    pending: PendingQueue<PendingRoute>,
    /// Gateways some queued route is waiting on.
    awaited: Mutex<HashSet<Ipv4Addr>>,
    probe: Arc<dyn GatewayProbe>,
    wake: Notify,
}

impl FlowTable {
    pub fn new(
        vm_id: VmId,
        ipc: Arc<IpcService>,
        interfaces: Vec<Interface>,
        probe: Arc<dyn GatewayProbe>,
    ) -> Self {
        Self {
            vm_id,
            ipc,
            interfaces: interfaces
                .into_iter()
                .map(|i| (i.name.clone(), i))
                .collect(),
            hosts: RwLock::new(HashMap::new()),
            down_ports: RwLock::new(HashSet::new()),
            pending: PendingQueue::new(),
            awaited: Mutex::new(HashSet::new()),
            probe,
            wake: Notify::new(),
        }
    }

    pub fn vm_id(&self) -> VmId {
        self.vm_id
    }

    /// Virtualized interfaces ordered by port.
    pub fn interfaces(&self) -> Vec<&Interface> {
        let mut interfaces: Vec<_> = self.interfaces.values().collect();
        interfaces.sort_by_key(|i| i.port);
        interfaces
    }

    pub fn interface_by_port(&self, port: u32) -> Option<&Interface> {
        self.interfaces.values().find(|i| i.port == port)
    }

    fn active_interface(&self, name: &str) -> Option<&Interface> {
        self.interfaces.get(name).filter(|i| i.active)
    }

    pub fn pending(&self) -> &PendingQueue<PendingRoute> {
        &self.pending
    }

    pub async fn host(&self, address: Ipv4Addr) -> Option<HostEntry> {
        self.hosts.read().await.get(&address).cloned()
    }

    pub async fn is_port_up(&self, port: u32) -> bool {
        !self.down_ports.read().await.contains(&port)
    }

    async fn send(&self, directive: Directive) -> Result<()> {
        self.ipc
            .send(
                CLIENT_SERVER_CHANNEL,
                SERVER_ID,
                &ClientMessage::RouteMod(directive),
            )
            .await?;
        Ok(())
    }

    fn await_gateway(&self, gateway: Ipv4Addr) {
        self.awaited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gateway);
    }

    /// Applies a neighbor change. Returns whether a host flow was sent.
    pub async fn handle_neighbor(&self, event: NeighborEvent) -> Result<bool> {
        match event {
            NeighborEvent::Add(record) => {
                let Some(interface) = self.active_interface(&record.ifname) else {
                    debug!(ip = %record.ip, ifname = %record.ifname, "Neighbor on unmanaged interface");
                    return Ok(false);
                };
                let entry = HostEntry {
                    address: record.ip,
                    hwaddress: record.mac,
                    interface: interface.clone(),
                };
                let previous = self
                    .hosts
                    .write()
                    .await
                    .insert(record.ip, entry.clone());

                let was_awaited = self
                    .awaited
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&record.ip);
                if was_awaited {
                    self.probe.resolved(record.ip);
                    self.wake.notify_one();
                }

                if previous.as_ref() == Some(&entry) {
                    return Ok(false);
                }
                info!(ip = %entry.address, mac = %entry.hwaddress, "Neighbor resolved");
                if !self.is_port_up(entry.interface.port).await {
                    debug!(port = entry.interface.port, "Port down, host flow held back");
                    return Ok(false);
                }
                self.send(entry.add_directive(self.vm_id)).await?;
                Ok(true)
            }
            NeighborEvent::Delete(record) => {
                let Some(entry) = self.hosts.write().await.remove(&record.ip) else {
                    return Ok(false);
                };
                info!(ip = %entry.address, "Neighbor removed");
                self.send(entry.delete_directive(self.vm_id)).await?;
                Ok(true)
            }
        }
    }

    /// Queues a route change for the resolver. Routes without a usable
    /// gateway or on unmanaged interfaces are ignored.
    pub fn handle_route(&self, event: RouteEvent) -> bool {
        let (op, record) = match event {
            RouteEvent::Add(record) => (RouteOp::Add, record),
            RouteEvent::Delete(record) => (RouteOp::Delete, record),
        };

        let Some(gateway) = record
            .gateway
            .filter(|gw| !gw.is_unspecified() && !gw.is_link_local())
        else {
            debug!(destination = %record.destination, "Route without a next hop ignored");
            return false;
        };
        let Some(interface) = self.active_interface(&record.ifname) else {
            debug!(
                destination = %record.destination,
                ifname = %record.ifname,
                "Route on unmanaged interface ignored"
            );
            return false;
        };

        let entry = RouteEntry {
            destination: record.destination.trunc(),
            gateway,
            interface: interface.clone(),
        };
        debug!(route = %entry, ?op, "Route queued");
        self.pending.push(PendingRoute::new(op, entry));
        true
    }

    /// Holds back host flows and route installs on a port.
    pub async fn port_down(&self, port: u32) {
        if self.down_ports.write().await.insert(port) {
            info!(port, "Port down");
        }
    }

    /// Lifts suppression on a port and re-announces its host flows. Returns
    /// how many were sent.
    pub async fn port_up(&self, port: u32) -> Result<usize> {
        if self.down_ports.write().await.remove(&port) {
            info!(port, "Port up");
        }

        let hosts: Vec<HostEntry> = self
            .hosts
            .read()
            .await
            .values()
            .filter(|h| h.interface.port == port)
            .cloned()
            .collect();
        for host in &hosts {
            self.send(host.add_directive(self.vm_id)).await?;
        }
        self.wake.notify_one();
        Ok(hosts.len())
    }

    pub async fn run_host_loop(self: Arc<Self>, mut events: mpsc::Receiver<NeighborEvent>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_neighbor(event).await {
                warn!(kind = %e.kind(), error = %e, "Host flow not sent");
            }
        }
        info!("Neighbor stream closed");
    }

    pub async fn run_route_loop(self: Arc<Self>, mut events: mpsc::Receiver<RouteEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_route(event);
        }
        info!("Route stream closed");
    }
}

/// What the resolver did with one queued route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Directive sent and the route table updated.
    Sent,
    /// Add for a route already installed.
    Duplicate,
    /// Delete for a route never installed.
    Stale,
    /// Gateway unknown or send failed; queued again at the tail.
    Requeued,
    /// Egress port down; queued again at the tail.
    Suppressed,
    /// Attempt limit reached.
    Abandoned,
}

/// Installs queued routes once their gateway resolves.
pub struct Resolver {
    table: Arc<FlowTable>,
    config: ResolverConfig,
    routes: Vec<RouteEntry>,
}

impl Resolver {
    pub fn new(table: Arc<FlowTable>, config: ResolverConfig) -> Self {
        Self {
            table,
            config,
            routes: Vec::new(),
        }
    }

    /// Routes installed so far.
    pub fn routes(&self) -> &[RouteEntry] {
        &self.routes
    }

    /// Processes the head of the queue, if any.
    pub async fn step(&mut self) -> Option<Resolution> {
        let item = self.table.pending.try_pop()?;
        Some(self.process(item).await)
    }

    pub async fn process(&mut self, item: PendingRoute) -> Resolution {
        let installed = self.routes.contains(&item.entry);
        match item.op {
            RouteOp::Add if installed => {
                debug!(route = %item.entry, "Duplicate route add discarded");
                Resolution::Duplicate
            }
            RouteOp::Delete if !installed => {
                debug!(route = %item.entry, "Stale route delete discarded");
                Resolution::Stale
            }
            RouteOp::Delete => {
                let directive = item.entry.delete_directive(self.table.vm_id);
                match self.table.send(directive).await {
                    Ok(()) => {
                        info!(route = %item.entry, "Route removed");
                        self.routes.retain(|r| r != &item.entry);
                        Resolution::Sent
                    }
                    Err(e) => self.send_failed(item, e),
                }
            }
            RouteOp::Add => {
                if !self.table.is_port_up(item.entry.interface.port).await {
                    self.table.pending.push(item);
                    return Resolution::Suppressed;
                }
                let Some(host) = self.table.host(item.entry.gateway).await else {
                    return self.unresolved(item);
                };
                let directive = item.entry.add_directive(self.table.vm_id, host.hwaddress);
                match self.table.send(directive).await {
                    Ok(()) => {
                        info!(route = %item.entry, mac = %host.hwaddress, "Route installed");
                        self.routes.push(item.entry);
                        Resolution::Sent
                    }
                    Err(e) => self.send_failed(item, e),
                }
            }
        }
    }

    fn unresolved(&self, mut item: PendingRoute) -> Resolution {
        item.attempts += 1;
        if self.config.max_attempts.is_some_and(|max| item.attempts >= max) {
            warn!(
                route = %item.entry,
                attempts = item.attempts,
                "Gateway never resolved, route dropped"
            );
            return Resolution::Abandoned;
        }

        let gateway = item.entry.gateway;
        debug!(route = %item.entry, attempts = item.attempts, "Gateway unresolved");
        self.table.await_gateway(gateway);
        self.table.probe.probe(gateway, &item.entry.interface);
        self.table.pending.push(item);
        Resolution::Requeued
    }

    fn send_failed(&self, item: PendingRoute, error: crate::ClientError) -> Resolution {
        warn!(route = %item.entry, kind = %error.kind(), error = %error, "Route directive not sent");
        self.table.pending.push(item);
        Resolution::Requeued
    }

    /// Works the queue forever. After a requeue it waits for a neighbor
    /// update or the retry interval, whichever comes first.
    pub async fn run(mut self) {
        loop {
            let item = self.table.pending.pop().await;
            match self.process(item).await {
                Resolution::Requeued | Resolution::Suppressed => {
                    tokio::select! {
                        _ = self.table.wake.notified() => {}
                        _ = tokio::time::sleep(self.config.retry_interval) => {}
                    }
                }
                _ => {}
            }
        }
    }
}
