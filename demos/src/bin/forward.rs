use std::sync::Arc;

use ssrwire::{Backend, PipeConfig, SocksAddr, dial, link, relay};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

// Usage: forward <ssr://link> <listen addr> <host> <port>
//
// Every connection accepted on the listen address is tunnelled to
// host:port through the relay.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().ok_or("missing ssr:// link")?;
    let listen = args.next().unwrap_or_else(|| "127.0.0.1:1080".to_string());
    let host = args.next().ok_or("missing destination host")?;
    let port: u16 = args.next().ok_or("missing destination port")?.parse()?;

    let descriptor = link::parse(&url, true).ok_or("malformed ssr:// link")?;
    let backend = Arc::new(Backend::new(descriptor));
    let pipe_config = Arc::new(PipeConfig::default());
    let dest = SocksAddr::from((host.as_str(), port));

    let listener = TcpListener::bind(&listen).await?;
    tracing::info!(%listen, %dest, "forwarding");

    loop {
        let (local, peer) = listener.accept().await?;
        let backend = Arc::clone(&backend);
        let pipe_config = Arc::clone(&pipe_config);
        let dest = dest.clone();
        tokio::spawn(async move {
            let remote = match dial(&backend, &dest).await {
                Ok(remote) => remote,
                Err(e) => {
                    tracing::warn!(%peer, error = %e, "dial failed");
                    return;
                }
            };
            tracing::info!(%peer, "tunnel open");
            if let Err(e) = relay(local, remote, &pipe_config).await {
                tracing::warn!(%peer, error = %e, "relay failed");
            }
            tracing::info!(%peer, "tunnel closed");
        });
    }
}
