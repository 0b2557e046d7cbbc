//! TrainForge Conductor Binary
//!
//! Standalone binary for the conductor server.
//! For library usage, see [`trainforge_conductor`].

use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use trainforge_conductor::{config::load_config, run_server, ServerConfig, Settings};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = Settings::from_env();

    // Initialize logging; RUST_LOG wins over CONDUCTOR_LOG_LEVEL
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "trainforge_conductor={},tower_http=info",
            settings.log_level.to_lowercase()
        ))
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    let config = load_config(&settings.config_path)?;

    let server = ServerConfig {
        host: settings.host,
        port: settings.port,
        config,
        print_banner: true,
    };

    run_server(server).await
}
