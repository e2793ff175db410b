//! Kernel route and neighbor notifications over rtnetlink.

use std::net::Ipv4Addr;

use futures::{StreamExt, TryStreamExt};
use ipnet::Ipv4Net;
use netlink_packet_core::NetlinkPayload;
use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage};
use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
use rfv_proto::MacAddress;
use rtnetlink::constants::{RTMGRP_IPV4_ROUTE, RTMGRP_NEIGH};
use netlink_sys::{AsyncSocket, SocketAddr};
use rtnetlink::{Handle, IpVersion};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::interfaces::interface_name;

const RT_TABLE_MAIN: u32 = 254;
const EVENT_QUEUE: usize = 1024;

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("Netlink error: {0}")]
    Netlink(String),

    #[error("Netlink socket error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rtnetlink::Error> for KernelError {
    fn from(e: rtnetlink::Error) -> Self {
        KernelError::Netlink(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborRecord {
    pub ip: Ipv4Addr,
    /// Zero when the kernel reports a removal without an address.
    pub mac: MacAddress,
    pub ifname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NeighborEvent {
    Add(NeighborRecord),
    Delete(NeighborRecord),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRecord {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub ifname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEvent {
    Add(RouteRecord),
    Delete(RouteRecord),
}

/// Extracts an IPv4 main-table route. Multipath routes are reduced to their
/// first hop.
pub fn parse_route<F>(msg: &RouteMessage, ifname: F) -> Option<RouteRecord>
where
    F: Fn(u32) -> Option<String>,
{
    if msg.header.address_family != AddressFamily::Inet {
        return None;
    }

    let mut table = u32::from(msg.header.table);
    let mut destination = Ipv4Addr::UNSPECIFIED;
    let mut gateway = None;
    let mut oif = None;
    for attr in &msg.attributes {
        match attr {
            RouteAttribute::Table(t) => table = *t,
            RouteAttribute::Destination(RouteAddress::Inet(addr)) => destination = *addr,
            RouteAttribute::Gateway(RouteAddress::Inet(addr)) => gateway = Some(*addr),
            RouteAttribute::Oif(index) => oif = Some(*index),
            RouteAttribute::MultiPath(hops) => {
                if let Some(hop) = hops.first() {
                    oif = Some(hop.interface_index);
                    gateway = hop.attributes.iter().find_map(|a| match a {
                        RouteAttribute::Gateway(RouteAddress::Inet(addr)) => Some(*addr),
                        _ => None,
                    });
                }
            }
            _ => {}
        }
    }

    if table != RT_TABLE_MAIN {
        return None;
    }
    let destination = Ipv4Net::new(destination, msg.header.destination_prefix_length).ok()?;
    Some(RouteRecord {
        destination,
        gateway,
        ifname: ifname(oif?)?,
    })
}

/// Extracts an IPv4 neighbor. Entries still resolving carry no link-layer
/// address and are skipped unless `removal` is set.
pub fn parse_neighbor<F>(
    msg: &NeighbourMessage,
    removal: bool,
    ifname: F,
) -> Option<NeighborRecord>
where
    F: Fn(u32) -> Option<String>,
{
    if msg.header.family != AddressFamily::Inet {
        return None;
    }

    let mut ip = None;
    let mut mac = None;
    for attr in &msg.attributes {
        match attr {
            NeighbourAttribute::Destination(NeighbourAddress::Inet(addr)) => ip = Some(*addr),
            NeighbourAttribute::LinkLocalAddress(bytes) => {
                mac = <[u8; 6]>::try_from(bytes.as_slice()).ok().map(MacAddress);
            }
            _ => {}
        }
    }

    let mac = match mac {
        Some(mac) => mac,
        None if removal => MacAddress::ZERO,
        None => return None,
    };
    Some(NeighborRecord {
        ip: ip?,
        mac,
        ifname: ifname(msg.header.ifindex)?,
    })
}

/// Receivers for kernel events.
pub struct KernelEvents {
    pub neighbors: mpsc::Receiver<NeighborEvent>,
    pub routes: mpsc::Receiver<RouteEvent>,
}

struct Senders {
    neighbors: mpsc::Sender<NeighborEvent>,
    routes: mpsc::Sender<RouteEvent>,
}

impl Senders {
    async fn dispatch(&self, message: RouteNetlinkMessage) {
        let delivered = match message {
            RouteNetlinkMessage::NewNeighbour(m) => {
                self.neighbor(parse_neighbor(&m, false, interface_name).map(NeighborEvent::Add))
                    .await
            }
            RouteNetlinkMessage::DelNeighbour(m) => {
                self.neighbor(parse_neighbor(&m, true, interface_name).map(NeighborEvent::Delete))
                    .await
            }
            RouteNetlinkMessage::NewRoute(m) => {
                self.route(parse_route(&m, interface_name).map(RouteEvent::Add)).await
            }
            RouteNetlinkMessage::DelRoute(m) => {
                self.route(parse_route(&m, interface_name).map(RouteEvent::Delete)).await
            }
            _ => true,
        };
        if !delivered {
            debug!("Kernel event receiver gone");
        }
    }

    async fn neighbor(&self, event: Option<NeighborEvent>) -> bool {
        match event {
            Some(event) => self.neighbors.send(event).await.is_ok(),
            None => true,
        }
    }

    async fn route(&self, event: Option<RouteEvent>) -> bool {
        match event {
            Some(event) => self.routes.send(event).await.is_ok(),
            None => true,
        }
    }

    /// Replays the current tables so state present before startup is seen.
    async fn dump(&self, handle: &Handle) -> Result<(), KernelError> {
        let mut neighbors = std::pin::pin!(handle.neighbours().get().execute());
        let mut count = 0usize;
        while let Some(msg) = neighbors.try_next().await? {
            self.dispatch(RouteNetlinkMessage::NewNeighbour(msg)).await;
            count += 1;
        }
        let mut routes = std::pin::pin!(handle.route().get(IpVersion::V4).execute());
        while let Some(msg) = routes.try_next().await? {
            self.dispatch(RouteNetlinkMessage::NewRoute(msg)).await;
            count += 1;
        }
        debug!(count, "Kernel tables replayed");
        Ok(())
    }
}

/// Subscribes to IPv4 route and neighbor changes, replays the current
/// tables and streams everything into the returned receivers.
pub fn subscribe() -> Result<(KernelEvents, JoinHandle<()>), KernelError> {
    let (mut connection, handle, mut messages) = rtnetlink::new_connection()?;
    let groups = RTMGRP_IPV4_ROUTE | RTMGRP_NEIGH;
    connection
        .socket_mut()
        .socket_mut()
        .bind(&SocketAddr::new(0, groups))?;
    tokio::spawn(connection);

    let (neighbors_tx, neighbors) = mpsc::channel(EVENT_QUEUE);
    let (routes_tx, routes) = mpsc::channel(EVENT_QUEUE);
    let senders = Senders {
        neighbors: neighbors_tx,
        routes: routes_tx,
    };

    let task = tokio::spawn(async move {
        if let Err(e) = senders.dump(&handle).await {
            warn!(error = %e, "Failed to replay kernel tables");
        }
        info!("Watching kernel routes and neighbors");
        while let Some((message, _)) = messages.next().await {
            if let NetlinkPayload::InnerMessage(inner) = message.payload {
                senders.dispatch(inner).await;
            }
        }
        warn!("Kernel notification stream closed");
    });

    Ok((KernelEvents { neighbors, routes }, task))
}
