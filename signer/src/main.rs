use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use quorum_vault_signer::rpc::{self, SignerService};

#[derive(Parser)]
#[command(name = "quorum-vault-signer")]
#[command(about = "Account-store plugin backed by a HashiCorp-compatible vault", long_about = None)]
struct Cli {
    /// Address to listen on; an ephemeral port by default
    #[arg(long, default_value = "127.0.0.1:0")]
    listen: SocketAddr,

    /// Initialize from a config file instead of waiting for the host's Init
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    // Logs go to stderr; stdout carries the handshake line to the host
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let service = SignerService::new();
    if let Some(path) = &cli.config {
        let raw = std::fs::read(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        service
            .initialize(&raw)
            .await
            .context("failed to initialize from config file")?;
    }

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    let addr = listener.local_addr()?;

    // Advertise the endpoint to the parent process over stdout
    println!("1|1|tcp|{}|grpc", addr);
    std::io::stdout().flush()?;

    info!(%addr, "plugin serving");
    rpc::serve(listener, service).await?;
    Ok(())
}
