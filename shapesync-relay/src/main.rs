use log::info;
use shapesync_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!(
        "Starting shapesync relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let relay = RelayServer::new(config);
    tokio::select! {
        result = relay.run() => {
            if let Err(e) = result {
                log::error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down, {} rooms active", relay.rooms().room_count().await);
        }
    }
}
