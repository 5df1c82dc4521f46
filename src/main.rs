//! echo-server: a TCP echo server with idle-timeout handling
//!
//! Accepts TCP connections on a configured port and echoes back
//! whatever bytes a client sends, byte-for-byte and in order, until
//! the client closes the connection or the idle timeout elapses.
//!
//! Usage: `echo-server <port> <idle-timeout-seconds>`

mod config;
mod server;

use clap::error::ErrorKind;
use config::{Config, ConfigError};
use server::Listener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(ConfigError::Parse(e))
            if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) =>
        {
            let _ = e.print();
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{e}");
            eprintln!("usage: echo-server <port> <idle-timeout-seconds>");
            std::process::exit(1);
        }
    };

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        port = config.port,
        idle_timeout = ?config.idle_timeout,
        "Starting echo server"
    );

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(config))
}

/// Bind the listener and serve until the process is terminated. Only
/// bind failures propagate; per-connection errors are contained inside
/// the accept loop.
async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let listener = Listener::bind(config.port)?;
    info!(address = %listener.local_addr()?, "Server listening");

    server::serve(listener, config.idle_timeout).await;
    Ok(())
}
