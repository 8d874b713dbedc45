use std::sync::Arc;

use dbfleet::runtime::DockerCompose;
use dbfleet::service::FleetService;
use dbfleet::transport::http::{serve, ServerConfig};
use dbfleet::FleetConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = FleetConfig::from_env();
    config.validate()?;

    let server_config = ServerConfig::from_env();

    let runtime = Arc::new(DockerCompose);
    let service = FleetService::new(config, runtime);

    serve(server_config, service).await
}
