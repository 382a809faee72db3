//! Configuration system for Tether.
//!
//! Provides the settings that drive the connection engine: target address,
//! timeouts, reconnection backoff, heartbeat, queueing, circuit breaker and
//! error-handling thresholds. Settings persist to disk as RON files, support
//! CLI overrides via clap and hot-reload detection.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    BackoffStrategy, BreakerConfig, Config, ConnectionConfig, DebugConfig, ErrorConfig,
    HeartbeatConfig, QueueConfig, ReconnectConfig,
};
pub use error::ConfigError;
