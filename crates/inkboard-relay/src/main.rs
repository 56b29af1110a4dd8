//! Inkboard relay server binary.

use clap::Parser;
use inkboard_relay::RelayConfig;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inkboard_relay=info,tower_http=info".into()),
        )
        .init();

    inkboard_relay::serve(RelayConfig::parse()).await
}
