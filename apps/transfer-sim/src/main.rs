//! Skyhop transfer simulator entry point.

mod config;
mod scenario;

use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting skyhop transfer simulator"
    );

    let path = config::config_path();
    let sim_config = match config::SimConfig::load(&path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            config::SimConfig::default()
        }
    };

    scenario::run(sim_config).await
}
