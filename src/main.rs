// src/main.rs

//! The main entry point for the ReplGuard monitoring daemon.

use replguard::config::Config;
use replguard::daemon;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

#[tokio::main]
async fn main() {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("ReplGuard version {VERSION}");
        return;
    }

    // The configuration path can be provided via a --config flag;
    // otherwise it defaults to "replguard.toml".
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .unwrap_or("replguard.toml")
        .to_string();

    let config = match Config::from_file(&config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e}");
            std::process::exit(e.exit_code());
        }
    };

    // Setup logging with reloading capabilities so SIGHUP can re-apply the
    // configured log level.
    let initial_log_level =
        std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .compact()
                .with_ansi(true),
        )
        .init();

    let reload_handle = Arc::new(reload_handle);

    if let Err(e) = daemon::run(config_path, config, Some(reload_handle)).await {
        error!("daemon runtime error: {}", e);
        std::process::exit(e.exit_code());
    }
}
