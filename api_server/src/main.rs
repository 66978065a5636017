use api_server::{init_tracing, serve};
use config_manager::SystemConfig;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration first: it decides the log format
    let config = SystemConfig::load()?;
    init_tracing(&config);

    info!("Starting wallet similarity API server...");
    info!("Configuration loaded successfully");

    // Collaborator clients are supplied by embedding crates through `serve`
    serve(config, None).await
}
