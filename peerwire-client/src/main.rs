// Peerwire sending node: connect to a listener, open a demo stream, send one
// message, close cleanly.

use std::sync::Arc;

use anyhow::Context;
use peerwire_core::{Keypair, Node, NodeConfig, ProtocolId, TcpTransport};
use tracing::info;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEMO_PROTOCOL: &str = "/demo/1.0.0";
const DEMO_MESSAGE: &str = "Hello from sender!";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let addr = match args.next() {
        Some(arg) if arg == "--version" || arg == "-V" => {
            println!("peerwire-client {VERSION}");
            return Ok(());
        }
        Some(addr) => addr,
        None => {
            eprintln!("usage: peerwire-client <server-address>");
            std::process::exit(2);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let keypair = Arc::new(Keypair::generate());
    let transport = TcpTransport::new(keypair);
    let node = Node::new(transport, NodeConfig::default());

    let peer = node
        .connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {addr}"))?;
    info!(%peer, %addr, "connected");

    let protocol = ProtocolId::new(DEMO_PROTOCOL).context("invalid protocol id")?;
    let session = node
        .open_stream(peer, protocol)
        .await
        .context("failed to open demo stream")?;
    session
        .send(DEMO_MESSAGE.as_bytes())
        .await
        .context("failed to send message")?;
    println!("sent {DEMO_MESSAGE:?} to {peer}");

    session.close().await.context("failed to close stream")?;
    if let Err(err) = node.shutdown().await {
        tracing::warn!(%err, "shutdown incomplete");
    }
    Ok(())
}
