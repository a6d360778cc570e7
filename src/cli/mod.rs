//! Command Line Interface module
//!
//! Implements the CLI commands and argument parsing for KuStream.

use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(name = "kustream")]
#[command(about = "KuStream Market Data Streaming Client")]
#[command(long_about = "A resilient KuCoin WebSocket client with automatic reconnection and resubscription")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Configuration file path
    #[arg(long, default_value = "config.toml")]
    pub config_file: String,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long)]
    pub log_level: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Subscribe to topics and print incoming messages
    Stream {
        /// Topic to subscribe to, e.g. /market/ticker:BTC-USDT (repeatable)
        #[arg(short, long = "topic")]
        topics: Vec<String>,

        /// Subscribe on the private channel (requires API credentials)
        #[arg(long)]
        private: bool,

        /// Use the sandbox environment
        #[arg(long)]
        sandbox: bool,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Stream {
            topics: Vec::new(),
            private: false,
            sandbox: false,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Reset configuration to defaults
    Reset,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Get the actual command, using default if none provided
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or_default()
    }

    /// Resolve the log level: `--verbose`, then `--log-level`, then the configured level
    pub fn effective_log_level(&self, configured: &str) -> String {
        if self.verbose {
            "debug".to_string()
        } else {
            self.log_level
                .clone()
                .unwrap_or_else(|| configured.to_string())
        }
    }
}
