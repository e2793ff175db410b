//! rfv-client: per-VM flow table synchronizer.
//!
//! Registers the VM with the registrar, announces its interfaces to the
//! switch translator and mirrors the kernel's routes and neighbors as
//! route directives.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use rfv_client::interfaces::{load_interfaces, vm_id_from_interface};
use rfv_client::mapping::RawMappingSender;
use rfv_client::probe::{DEFAULT_PROBE_PORT, TcpProbe};
use rfv_client::{FlowTable, Resolver, ResolverConfig, RfClient, kernel};
use rfv_proto::ClientMessage;
use rfv_proto::config::IpcArgs;
use rfv_proto::defs::{CLIENT_SERVER_CHANNEL, vm_participant};
use rfv_proto::ipc::IpcService;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Routing virtualization VM client
#[derive(Parser, Debug)]
#[command(name = "rfv-client", version, about)]
struct Args {
    #[command(flatten)]
    ipc: IpcArgs,

    /// Interface whose hardware address identifies this VM
    #[arg(long, default_value = "eth0")]
    id_interface: String,

    /// Management interface, never virtualized
    #[arg(long, default_value = "eth0")]
    mgmt_interface: String,

    /// Pause in milliseconds after a route had to be requeued
    #[arg(long, default_value_t = 20)]
    retry_interval_ms: u64,

    /// Give up on a route after this many unresolved attempts (default: never)
    #[arg(long)]
    max_resolve_attempts: Option<u32>,

    /// TCP port used to trigger gateway resolution
    #[arg(long, default_value_t = DEFAULT_PROBE_PORT)]
    probe_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rfv_client=info,rfv_proto=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.ipc.config();

    let vm_id = vm_id_from_interface(&args.id_interface)
        .with_context(|| format!("Failed to read VM id from {}", args.id_interface))?;
    let interfaces = load_interfaces(&args.mgmt_interface)?;

    info!("Starting rfv-client");
    info!("Store: {}", config.db_path.display());
    info!(vm_id, interfaces = interfaces.len(), "VM identity");
    for interface in &interfaces {
        info!(
            port = interface.port,
            name = %interface.name,
            mac = %interface.hwaddress,
            "Virtualized interface"
        );
    }

    let ipc = Arc::new(IpcService::open(vm_participant(vm_id), &config).await?);
    let probe = Arc::new(TcpProbe::new(args.probe_port));
    let flows = Arc::new(FlowTable::new(vm_id, Arc::clone(&ipc), interfaces, probe));
    let mapping = Arc::new(RawMappingSender::new().context("Failed to open raw socket")?);
    let client = Arc::new(RfClient::new(Arc::clone(&ipc), Arc::clone(&flows), mapping));

    let listener = ipc.listen::<ClientMessage, _>(CLIENT_SERVER_CHANNEL, Arc::clone(&client));
    client.register().await;

    let (events, mut netlink) = kernel::subscribe()?;
    let host_loop = tokio::spawn(Arc::clone(&flows).run_host_loop(events.neighbors));
    let route_loop = tokio::spawn(Arc::clone(&flows).run_route_loop(events.routes));
    let resolver = Resolver::new(
        Arc::clone(&flows),
        ResolverConfig {
            retry_interval: Duration::from_millis(args.retry_interval_ms),
            max_attempts: args.max_resolve_attempts,
        },
    );
    let resolver = tokio::spawn(resolver.run());

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        _ = &mut netlink => {
            error!("Netlink connection closed");
        }
    }

    listener.shutdown().await;
    netlink.abort();
    host_loop.abort();
    route_loop.abort();
    resolver.abort();
    info!("rfv-client stopped");
    Ok(())
}
