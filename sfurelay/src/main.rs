mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;

use sfurelay_api::{AppState, GatewaySettings};
use sfurelay_core::{bootstrap::load_config, logging, Config};
use sfurelay_sfu::{SfuConfig, SfuManager, WebRtcTransportFactory};

use server::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "sfurelay")]
#[command(about = "WebRTC selective forwarding unit with WebSocket signaling", long_about = None)]
struct Args {
    /// Path to a YAML/TOML/JSON config file
    #[arg(long, short, env = "SFURELAY_CONFIG_PATH")]
    config: Option<String>,
}

fn sfu_config(config: &Config) -> SfuConfig {
    SfuConfig {
        max_sessions: config.gateway.max_clients,
        ice_servers: config.webrtc.stun_servers.clone(),
        ice_candidate_pool_size: config.webrtc.ice_candidate_pool_size,
        ice_gathering_timeout: config.webrtc.ice_gathering_timeout(),
        release_consumers_on_viewer_exit: config.webrtc.release_consumers_on_viewer_exit,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load and validate configuration
    let config = load_config(args.config.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("sfurelay starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Install the rustls crypto provider used by the HTTPS listener
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    // 4. Build the WebRTC engine and the session manager
    let sfu_config = sfu_config(&config);
    let factory = WebRtcTransportFactory::new(&sfu_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize WebRTC engine: {e}"))?;
    info!(
        max_sessions = sfu_config.max_sessions,
        ice_servers = ?sfu_config.ice_servers,
        "WebRTC engine initialized"
    );
    let manager = SfuManager::new(sfu_config, Arc::new(factory));

    // 5. Serve until a shutdown signal arrives
    let state = AppState::new(Arc::clone(&manager), GatewaySettings::from_config(&config));
    RelayServer::new(config, manager, state).start().await
}
