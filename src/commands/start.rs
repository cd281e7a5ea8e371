use anyhow::Result;

use api_gateway::{config, server};

/// Load configuration and run the server until shutdown.
pub async fn execute() -> Result<()> {
    let cfg = config::load_config()?;
    server::start_server(cfg).await
}
