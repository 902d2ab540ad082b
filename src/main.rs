use git_pipeliner::logging::{FileLogger, setup_logging};
use std::path::Path;
use git_pipeliner::{Pipeliner, PipelinerConfig, PipelinerError};
use tracing::{error, info};

const DEFAULT_CONFIG_PATH: &str = "pipeliner.toml";

/// Load the configuration file, then apply environment overrides
fn load_config(path: &str) -> Result<PipelinerConfig, PipelinerError> {
    PipelinerConfig::load(path)?.apply_env(|key| std::env::var(key).ok())
}

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let config_path =
        std::env::var("PIPELINER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

    let config = match load_config(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let file_logger = FileLogger::from_config(&config);
    let _log_guard = match setup_logging(file_logger.as_ref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to set up logging: {}", e);
            std::process::exit(1);
        }
    };

    if Path::new(&config_path).exists() {
        info!("Using config at {:?}", config_path);
    } else {
        info!("No config file at {:?}, using defaults", config_path);
    }
    info!("Scripts path: {:?}", config.scripts_path);

    let mut pipeliner = match Pipeliner::new(config) {
        Ok(pipeliner) => pipeliner,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = pipeliner.init().await {
        error!("{}", e);
        std::process::exit(1);
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    if let Err(e) = pipeliner.stop().await {
        error!("{}", e);
    }
}
