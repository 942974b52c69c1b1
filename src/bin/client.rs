//! rsstp Client Binary
//!
//! Connects to an SSTP gateway and forwards traffic through a TUN interface
//! until interrupted.

use log::{debug, error, info};
use rsstp::{Config, Result, VpnClient, VpnError};
use std::env;
use std::process;
use tokio::signal;
use tokio_util::sync::CancellationToken;

fn config_path() -> Option<String> {
    let args: Vec<String> = env::args().skip(1).collect();
    match args.as_slice() {
        [flag, path] if flag == "--config" => Some(path.clone()),
        [path] if !path.starts_with("--") => Some(path.clone()),
        [] => Some("config.toml".to_string()),
        _ => None,
    }
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                debug!("Received Ctrl+C");
            }
            _ = sigterm.recv() => debug!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        debug!("Received Ctrl+C");
    }
    Ok(())
}

fn print_usage() {
    println!("rsstp Client v{}", rsstp::VERSION);
    println!("An SSTP VPN client with TUN support");
    println!();
    println!("USAGE:");
    println!("    rsstp-client [--config] [CONFIG_FILE]");
    println!();
    println!("ARGS:");
    println!("    CONFIG_FILE    Path to configuration file (default: config.toml)");
    println!();
    println!("PRIVILEGES:");
    println!("    Creating the TUN interface and installing routes needs root");
    println!("    or CAP_NET_ADMIN.");
}

async fn run(config: Config) -> Result<()> {
    let client = VpnClient::new(config)?;
    let shutdown = CancellationToken::new();

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Signal handler failed: {e}");
        }
        info!("Shutdown requested");
        trigger.cancel();
    });

    client.run(shutdown).await?;
    if let Some(message) = client.last_outcome() {
        info!("Last connection ended: {message}");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let Some(path) = config_path() else {
        print_usage();
        process::exit(2);
    };

    let config = match Config::from_file(&path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {path}: {e}");
            process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    info!("Starting rsstp client v{}", rsstp::VERSION);
    debug!("Gateway {}:{}", config.server.hostname, config.server.port);

    if let Err(e) = run(config).await {
        error!("{e}");
        let code = match e {
            VpnError::Config(_) => 2,
            _ => 1,
        };
        process::exit(code);
    }
    info!("Disconnected");
}
