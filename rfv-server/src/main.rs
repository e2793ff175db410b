//! rfv-server: association registrar.
//!
//! Pairs routing VMs with OpenFlow datapaths, records which VM port sits
//! behind which switch port and forwards route reports to the switch
//! translator.

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rfv_proto::config::IpcArgs;
use rfv_proto::defs::{CLIENT_SERVER_CHANNEL, SERVER_ID, SERVER_PROXY_CHANNEL};
use rfv_proto::ipc::{EnvelopeStore, IpcService, open_pool};
use rfv_proto::{ClientMessage, ProxyMessage};
use rfv_server::{Registry, RfServer};
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Routing virtualization registrar
#[derive(Parser, Debug)]
#[command(name = "rfv-server", version, about)]
struct Args {
    #[command(flatten)]
    ipc: IpcArgs,

    /// Keep the association table from a previous run instead of clearing it
    #[arg(long)]
    keep_table: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the association table and exit
    Dump {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn opt<T: std::fmt::Display>(v: Option<T>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

async fn dump(registry: &Registry, json: bool) -> Result<()> {
    let records = registry.all().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    println!(
        "{:<36}  {:>16}  {:>7}  {:>16}  {:>7}  {:>16}  {:>7}",
        "ID", "VM", "VM_PORT", "VS", "VS_PORT", "DP", "DP_PORT"
    );
    for r in records {
        println!(
            "{:<36}  {:>16}  {:>7}  {:>16}  {:>7}  {:>16}  {:>7}",
            r.id,
            opt(r.vm_id),
            opt(r.vm_port),
            opt(r.vs_id),
            opt(r.vs_port),
            opt(r.dp_id),
            opt(r.dp_port)
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rfv_server=info,rfv_proto=info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.ipc.config();

    let pool = open_pool(&config.db_path).await?;
    let registry = Registry::new(pool.clone()).await?;

    if let Some(Command::Dump { json }) = args.command {
        return dump(&registry, json).await;
    }

    info!("Starting rfv-server");
    info!("Store: {}", config.db_path.display());

    if !args.keep_table {
        registry.clear().await?;
        info!("Association table cleared");
    }

    let store = Arc::new(EnvelopeStore::new(pool).await?);
    let ipc = Arc::new(IpcService::new(SERVER_ID, store, &config));
    let server = Arc::new(RfServer::new(Arc::clone(&ipc), registry));

    let client_listener = ipc.listen::<ClientMessage, _>(CLIENT_SERVER_CHANNEL, Arc::clone(&server));
    let proxy_listener = ipc.listen::<ProxyMessage, _>(SERVER_PROXY_CHANNEL, Arc::clone(&server));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    client_listener.shutdown().await;
    proxy_listener.shutdown().await;
    info!("rfv-server stopped");
    Ok(())
}
