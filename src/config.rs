//! Configuration module for the echo server.
//!
//! The whole surface is a port and an idle timeout, taken from the
//! command line. Malformed input is reported as a `ConfigError` so the
//! caller can print usage and exit before any socket is created.

use clap::Parser;
use std::time::Duration;

/// Command-line arguments for the echo server
#[derive(Parser, Debug)]
#[command(name = "echo-server")]
#[command(version = "0.1.0")]
#[command(about = "A TCP echo server with a per-connection idle timeout", long_about = None)]
pub struct CliArgs {
    /// Port to listen on (1-65535)
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Seconds to wait for client data before closing the connection
    pub idle_timeout: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub idle_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Resolve configuration from the process command line.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::try_parse().map_err(ConfigError::Parse)?)
    }

    fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        // A zero window would time out every connection before its
        // first read.
        if cli.idle_timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(Config {
            port: cli.port,
            idle_timeout: Duration::from_secs(cli.idle_timeout),
            log_level: cli.log_level,
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    Parse(clap::Error),
    ZeroTimeout,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Parse(e) => write!(f, "{e}"),
            ConfigError::ZeroTimeout => {
                write!(f, "idle timeout must be at least 1 second")
            }
        }
    }
}

impl std::error::Error for ConfigError {}
