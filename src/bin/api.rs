use impulses::{api::start_server, app::Impulses, config::Config};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::from_env()?;
    let port = config.port;

    info!("Impulses - API Server");
    info!("Port: {}", port);

    let app = Arc::new(Impulses::from_config(config)?);

    start_server(app, port).await?;

    Ok(())
}
