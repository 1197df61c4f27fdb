use async_trait::async_trait;
use sipper::config::SipConfiguration;
use sipper::{
    install_shutdown_hook, ConnectionRegistry, RegisteredSipConnection, SipClient,
    SipEventHandler, SipInviteEvent,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG_PATH: &str = "sipper.toml";

/// Logs each call and answers with 180 Ringing
struct RingLogger;

#[async_trait]
impl SipEventHandler for RingLogger {
    async fn on_ring(
        &self,
        connection: RegisteredSipConnection,
        invite: SipInviteEvent,
    ) -> anyhow::Result<()> {
        info!("RING RING: {} calling (Call-ID {})", invite.from, invite.call_id);
        connection.send_ringing(&invite).await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = SipConfiguration::load(&path)?;
    info!("Configuration loaded from {} (registrar {})", path, config.registrar);

    let client = SipClient::new(config)?;
    let connection = client.connect().await?;
    connection.listen(Arc::new(RingLogger));
    info!("Listening for calls, press Ctrl-C to quit");

    // Keep the registration running until Ctrl-C or SIGTERM
    let closed = install_shutdown_hook(ConnectionRegistry::global()).await?;
    info!("Closed {} registration(s), last state: {}", closed, connection.state());

    Ok(())
}
