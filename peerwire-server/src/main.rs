// Peerwire listening node: fresh identity, TCP transport, demo protocol.

mod config;

use std::sync::Arc;

use anyhow::Context;
use peerwire_core::{Keypair, Node, NodeConfig, ProtocolId, TcpTransport};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEMO_PROTOCOL: &str = "/demo/1.0.0";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    for arg in std::env::args().skip(1) {
        if arg == "--version" || arg == "-V" {
            println!("peerwire-server {VERSION}");
            return Ok(());
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = config::load();
    let keypair = Arc::new(Keypair::generate());
    let transport = TcpTransport::new(keypair);
    let node = Node::new(
        transport,
        NodeConfig {
            max_frame_len: cfg.max_frame_len,
            ..NodeConfig::default()
        },
    );

    let demo = ProtocolId::new(DEMO_PROTOCOL).context("invalid protocol id")?;
    node.register_fn(demo, |inbound| {
        let text = String::from_utf8_lossy(&inbound.payload);
        println!("[{}] {}", inbound.peer, text.trim_end());
    })
    .context("failed to register demo handler")?;

    let addr = node
        .start(&cfg.listen_addr)
        .await
        .context("failed to start node")?;
    println!("listening on {addr}");
    println!("peer id: {}", node.local_peer());

    shutdown_signal().await?;
    info!("shutting down");
    if let Err(err) = node.shutdown().await {
        tracing::warn!(%err, "shutdown incomplete");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
