//! Command-line argument parsing for Tether.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Tether command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Resilient game-server connection client")]
pub struct CliArgs {
    /// Server address (e.g. tcp://127.0.0.1:7777).
    #[arg(long)]
    pub server: Option<String>,

    /// Bearer token sent on connect.
    #[arg(long, env = "TETHER_AUTH_TOKEN")]
    pub auth_token: Option<String>,

    /// Disable automatic reconnection.
    #[arg(long)]
    pub no_reconnect: bool,

    /// Maximum reconnection attempts per cycle.
    #[arg(long)]
    pub max_attempts: Option<u32>,

    /// Heartbeat interval in milliseconds.
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,

    /// Include technical detail in error notices.
    #[arg(long)]
    pub verbose_errors: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref server) = args.server {
            self.connection.server_url = server.clone();
        }
        if let Some(ref token) = args.auth_token {
            self.connection.auth_token = Some(token.clone());
        }
        if args.no_reconnect {
            self.reconnect.enabled = false;
        }
        if let Some(attempts) = args.max_attempts {
            self.reconnect.max_attempts = attempts;
        }
        if let Some(ms) = args.heartbeat_ms {
            self.heartbeat.interval_ms = ms;
        }
        if args.verbose_errors {
            self.errors.verbose = true;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> CliArgs {
        CliArgs {
            server: None,
            auth_token: None,
            no_reconnect: false,
            max_attempts: None,
            heartbeat_ms: None,
            verbose_errors: false,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            server: Some("192.168.1.1:9000".to_string()),
            no_reconnect: true,
            max_attempts: Some(3),
            ..empty_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.connection.server_url, "192.168.1.1:9000");
        assert!(!config.reconnect.enabled);
        assert_eq!(config.reconnect.max_attempts, 3);
        // Non-overridden fields retain defaults
        assert_eq!(config.heartbeat.interval_ms, 30_000);
        assert!(!config.errors.verbose);
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&empty_args());
        assert_eq!(config, original);
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from([
            "tether",
            "--server",
            "tcp://10.0.0.2:7777",
            "--heartbeat-ms",
            "5000",
            "--verbose-errors",
        ]);
        assert_eq!(args.server.as_deref(), Some("tcp://10.0.0.2:7777"));
        assert_eq!(args.heartbeat_ms, Some(5000));
        assert!(args.verbose_errors);
        assert!(!args.no_reconnect);
    }
}
