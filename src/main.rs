//! rpcmux - multiplexed RPC over TCP
//!
//! Runs the echo server, or a self-contained demo that starts a server on an
//! ephemeral port and issues concurrent calls against it.

use clap::{Parser, Subcommand};
use rpcmux_client::{completion_queue, Client, ClientConfig};
use rpcmux_server::{Config, EchoDispatcher, Server, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rpcmux")]
#[command(about = "Multiplexed RPC server over TCP")]
#[command(version)]
struct Cli {
    /// Path to a YAML config file
    #[arg(short, long, env = "RPCMUX_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind to (overrides the config file)
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the echo dispatcher until Ctrl-C (default)
    Serve,

    /// Start a server on an ephemeral port and call it
    Demo {
        /// Number of concurrent calls
        #[arg(short = 'n', long, default_value_t = 5)]
        calls: u64,

        /// Codec used by the demo client
        #[arg(long, default_value = rpcmux_protocol::BINCODE_TYPE)]
        codec: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut config = match cli.config {
        Some(ref path) => {
            let config = Config::load_from(path).map_err(|e| {
                tracing::error!("Failed to load config: {}", e);
                e
            })?;
            tracing::info!("Loaded config from {}", path.display());
            config
        }
        None => Config::load()?,
    };
    if let Some(bind) = cli.bind {
        config.network.bind_addr = bind;
    }
    config.validate()?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(&config).await,
        Commands::Demo { calls, codec } => demo(&config, calls, codec).await,
    }
}

async fn serve(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let server_config = config.server_config()?;

    tracing::info!("Starting rpcmux server");
    tracing::info!("  Bind address: {}", server_config.bind_addr);
    tracing::info!("  Max connections: {}", server_config.max_connections);
    tracing::info!("  Codecs: {}", server_config.registry.tags().join(", "));

    let server = Arc::new(Server::new(server_config, EchoDispatcher));

    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    server.run().await?;

    tracing::info!("Server stopped");
    Ok(())
}

async fn demo(
    config: &Config,
    calls: u64,
    codec: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let server_config = ServerConfig::new(addr).with_registry(Arc::new(config.registry()?));
    let server = Arc::new(Server::new(server_config, EchoDispatcher));
    let serve_task = {
        let server = server.clone();
        tokio::spawn(async move { server.serve(listener).await })
    };

    let client = Client::dial(addr, ClientConfig::new().with_codec(codec)).await?;
    tracing::info!("Connected to {} using {}", addr, client.codec());

    let capacity = usize::try_from(calls.max(1))?;
    let (done_tx, mut done) = completion_queue(capacity);
    for i in 1..=calls {
        client
            .go_with("Foo.Sum", format!("rpcmux req {}", i), String::new(), done_tx.clone())
            .await;
    }
    drop(done_tx);

    while let Some(call) = done.recv().await {
        match call.into_result() {
            Ok(reply) => tracing::info!("reply: {}", reply),
            Err(e) => tracing::warn!("call failed: {}", e),
        }
    }

    client.close().await?;
    server.shutdown();
    serve_task.await??;
    Ok(())
}
