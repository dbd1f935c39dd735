//! Uniform Gateway - hosts one channel for remote peers.
//!
//! Peers connect over the framed TCP channel port and invoke the objects the
//! gateway exposes. A JSON-RPC 2.0 HTTP endpoint bridges plain HTTP clients
//! into the same channel.

mod handler;
mod server;
mod system;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uniform_core::{Channel, ChannelStorage, LoopbackBinding, SocketServer};

#[derive(Parser, Debug)]
#[command(name = "uniform-gateway")]
#[command(about = "Channel host with a JSON-RPC bridge")]
struct Args {
    /// HTTP port for JSON-RPC (0 = auto-assign)
    #[arg(short, long, default_value = "0")]
    port: u16,

    /// TCP port for channel peers (0 = auto-assign)
    #[arg(long, default_value = "0")]
    channel_port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Name of the hosted channel
    #[arg(short, long, default_value = "gateway")]
    name: String,

    /// SQLite database enabling the exchange and mailbox objects
    #[arg(long)]
    db: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level.as_str())),
        )
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Uniform Gateway ({})", args.name);

    let channel = Channel::new(&args.name);
    // Requests addressed to the gateway itself loop back into its executor.
    channel.attach(LoopbackBinding::new(), Some(&args.name));

    let storage = match &args.db {
        Some(path) => {
            info!("Opening channel storage at {}", path.display());
            Some(ChannelStorage::open_at(&args.name, path)?)
        }
        None => None,
    };
    system::install(&channel, storage);

    let accepting = channel.clone();
    let mut socket_server = SocketServer::start((args.host.as_str(), args.channel_port), move |binding| {
        accepting.listen(binding, None);
    })
    .await?;

    let addr = server::start_server(channel.clone(), &args.host, args.port).await?;

    // Ports are read from stdout by supervising processes
    println!("RPC_PORT={}", addr.port());
    println!("CHANNEL_PORT={}", socket_server.port());

    info!("RPC server running on {}", addr);
    info!("Channel socket listening on {}", socket_server.addr());

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    socket_server.shutdown();
    channel.close();

    Ok(())
}
