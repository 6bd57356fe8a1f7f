use anyhow::Context;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use dropwire_rendezvous::{RendezvousConfig, RoomStore, serve};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "dropwire_rendezvous=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = RendezvousConfig::from_env().context("load rendezvous config")?;
    let store = RoomStore::new();

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    tracing::info!(event = "rendezvous_listening", addr = %config.listen_addr);

    serve(listener, store).await.context("serve rendezvous")?;
    Ok(())
}
