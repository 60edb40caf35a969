//! Realtime Copilot server
//!
//! Live transcription and AI hints over a single WebSocket.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use realtime_copilot::config::Settings;

#[derive(Parser, Debug)]
#[command(name = "copilot-server", about = "Realtime interview & meeting copilot server", version)]
struct Args {
    /// Bind address (overrides SERVER_HOST)
    #[arg(long)]
    host: Option<String>,

    /// Bind port (overrides SERVER_PORT)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut settings = Settings::from_env()?;
    if let Some(host) = args.host {
        settings.server_host = host;
    }
    if let Some(port) = args.port {
        settings.server_port = port;
    }

    // RUST_LOG wins over the configured level when set.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.as_filter())),
        )
        .init();

    tracing::info!(
        host = %settings.server_host,
        port = settings.server_port,
        "starting realtime copilot server"
    );

    realtime_copilot::server::start(settings).await
}
