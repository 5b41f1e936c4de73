//! shapeboard relay — multi-room WebSocket relay for shapeboard clients.
//!
//! Listens on `0.0.0.0:1234` unless `HOST` / `PORT` say otherwise. The same
//! port answers plain HTTP requests with a liveness response.

use log::{error, info};
use shapeboard_collab::{ServerConfig, SyncServer};

fn config_from_env() -> ServerConfig {
    let mut config = ServerConfig::default();
    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port = std::env::var("PORT").unwrap_or_else(|_| "1234".to_string());
    config.bind_addr = format!("{host}:{port}");
    config
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = config_from_env();
    info!("Starting shapeboard relay on {}...", config.bind_addr);

    let server = SyncServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
