use std::process::ExitCode;

use quire_node::{Node, NodeConfig};

const DEFAULT_CONFIG: &str = "server_config.json";

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SERVER_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    let config = match NodeConfig::load(&path) {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let handle = match Node::new(config) {
        Ok(node) => match node.start().await {
            Ok(handle) => handle,
            Err(e) => {
                log::error!("{e}");
                return ExitCode::FAILURE;
            }
        },
        Err(e) => {
            log::error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for ctrl-c: {e}");
    }
    handle.shutdown().await;
    ExitCode::SUCCESS
}
