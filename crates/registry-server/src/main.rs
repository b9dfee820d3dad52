//! Registry server binary

use registry_server::{Config, RegistryServer, setup_tracing};
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Optional explicit config path; a bad explicit file is fatal
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);

    // Load configuration first (needed for telemetry settings)
    let config = match Config::load(explicit_path.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) if explicit_path.is_some() => return Err(e.into()),
        Err(e) => {
            // Can't use tracing yet - not initialized
            eprintln!("Configuration error: {}", e);
            eprintln!("Using default configuration");
            Config::default()
        }
    };

    let _telemetry_guard = setup_tracing(&config.telemetry, &config.logging)?;

    tracing::info!(
        bootstrap_instances = config.bootstrap.instances.len(),
        "Registry server starting"
    );

    RegistryServer::new(config).run().await?;

    // Telemetry guard will flush spans on drop
    Ok(())
}
