use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ajpd::{Config, Connector, InMemorySessionStore, PingApplication};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    let config = Config::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.server.log_level.clone())),
        )
        .init();

    let app = Arc::new(PingApplication);
    let sessions = Arc::new(InMemorySessionStore::new(Duration::from_secs(
        config.protocol.session_ttl_secs,
    )));

    let mut connector = Connector::new(config, app, sessions);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c received; shutting down");
            signal_token.cancel();
        }
    });

    connector.run(shutdown).await
}
