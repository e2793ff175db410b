//! rfv-proxy: switch translator.
//!
//! Accepts OpenFlow 1.0 switch connections, reports datapath and mapping
//! events to the registrar and installs the flows it asks for.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use rfv_proto::config::IpcArgs;
use rfv_proto::defs::{PROXY_ID, SERVER_PROXY_CHANNEL};
use rfv_proto::ipc::IpcService;
use rfv_proto::{DpId, ProxyMessage};
use rfv_proxy::{ControllerHost, OfHost, RfProxy};
use tokio::net::TcpListener;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Routing virtualization switch translator
#[derive(Parser, Debug)]
#[command(name = "rfv-proxy", version, about)]
struct Args {
    #[command(flatten)]
    ipc: IpcArgs,

    /// OpenFlow listen address
    #[arg(long, default_value = "0.0.0.0:6633")]
    listen: SocketAddr,

    /// Datapath id of the bootstrap switch (decimal or 0x-prefixed hex)
    #[arg(long, value_parser = parse_dpid)]
    bootstrap_dpid: Option<DpId>,
}

fn parse_dpid(s: &str) -> Result<DpId, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => DpId::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid datapath id '{s}': {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rfv_proxy=info,rfv_proto=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.ipc.config();

    info!("Starting rfv-proxy");
    info!("Store: {}", config.db_path.display());

    let ipc = Arc::new(IpcService::open(PROXY_ID, &config).await?);
    let (host, events) = OfHost::new(args.bootstrap_dpid);
    let proxy = Arc::new(RfProxy::new(
        Arc::clone(&ipc),
        Arc::clone(&host) as Arc<dyn ControllerHost>,
    ));

    let listener = TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("Failed to bind {}", args.listen))?;
    let accept = tokio::spawn(Arc::clone(&host).serve(listener));

    let event_proxy = Arc::clone(&proxy);
    let event_loop = tokio::spawn(async move { event_proxy.run(events).await });

    let server_listener = ipc.listen::<ProxyMessage, _>(SERVER_PROXY_CHANNEL, proxy);

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
        result = accept => {
            match result {
                Ok(Err(e)) => error!(error = %e, "OpenFlow listener failed"),
                Err(e) => error!(error = %e, "OpenFlow listener panicked"),
                Ok(Ok(())) => {}
            }
        }
    }

    server_listener.shutdown().await;
    event_loop.abort();
    info!("rfv-proxy stopped");
    Ok(())
}
