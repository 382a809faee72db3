//! Configuration structs with sensible defaults, validation and RON persistence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Target address, timeouts and credentials.
    pub connection: ConnectionConfig,
    /// Automatic reconnection and backoff.
    pub reconnect: ReconnectConfig,
    /// Liveness probing.
    pub heartbeat: HeartbeatConfig,
    /// Outbound message queue.
    pub queue: QueueConfig,
    /// Circuit breaker thresholds.
    pub breaker: BreakerConfig,
    /// Error log, user notices and escalation thresholds.
    pub errors: ErrorConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Connection target and transport options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Server address, e.g. `tcp://play.example.net:7777` or `127.0.0.1:7777`.
    pub server_url: String,
    /// Upper bound on a single connect attempt, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Upper bound on waiting for a reply (heartbeat pong, ping), in milliseconds.
    pub message_timeout_ms: u64,
    /// Validate server certificates on TLS-capable transports.
    pub verify_certificates: bool,
    /// Bearer token sent as an `Authorization` header when set.
    pub auth_token: Option<String>,
    /// Extra headers handed to the transport on open.
    pub headers: HashMap<String, String>,
    /// Capacity of the inbound frame buffer between transport and dispatcher.
    pub inbound_buffer: usize,
}

/// Backoff curve used between reconnection or retry attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Always `base_delay`.
    Fixed,
    /// `base_delay × attempt`.
    Linear,
    /// `base_delay × factor^(attempt - 1)`.
    Exponential,
    /// Exponential, scaled by a uniform random factor in `[jitter_min, jitter_max]`.
    ExponentialJitter,
}

/// Automatic reconnection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Reconnect automatically after an unexpected closure or failed connect.
    pub enabled: bool,
    /// Attempts per reconnection cycle before resting in the error state.
    pub max_attempts: u32,
    /// Delay before the first attempt, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier for exponential strategies.
    pub backoff_factor: f64,
    /// Cap on any single delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Shape of the delay curve.
    pub strategy: BackoffStrategy,
    /// Lower bound of the jitter multiplier.
    pub jitter_min: f64,
    /// Upper bound of the jitter multiplier.
    pub jitter_max: f64,
}

/// Heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Start the heartbeat automatically once connected.
    pub enabled: bool,
    /// Interval between pings, in milliseconds.
    pub interval_ms: u64,
    /// Message type tag used for outgoing pings.
    pub ping_type: String,
    /// Message type tag the server uses for replies.
    pub pong_type: String,
}

/// Outbound queue settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// Buffer sends made while not connected.
    pub enabled: bool,
    /// Maximum buffered messages; further sends are dropped.
    pub max_size: usize,
}

/// Circuit breaker thresholds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the breaker.
    pub failure_threshold: u32,
    /// Failure ratio over the rolling window that opens the breaker (0.0 - 1.0).
    pub failure_rate_threshold: f64,
    /// Number of recent outcomes kept in the rolling window.
    pub window_size: usize,
    /// Outcomes required before the failure ratio is evaluated.
    pub minimum_calls: usize,
    /// Time spent open before a half-open probe is allowed, in milliseconds.
    pub cooldown_ms: u64,
}

/// Error recording, notification and escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ErrorConfig {
    /// Capacity of the error record ring buffer.
    pub log_capacity: usize,
    /// Append technical detail to user-facing messages.
    pub verbose: bool,
    /// Minimum time between two notices of the same error kind, in milliseconds.
    pub notification_cooldown_ms: u64,
    /// Consecutive failures that count as an abnormal pattern.
    pub consecutive_threshold: u32,
    /// Errors within `rate_window_ms` that count as an abnormal rate.
    pub rate_threshold: usize,
    /// Window for rate and spike detection, in milliseconds.
    pub rate_window_ms: u64,
    /// Errors of a single kind within `rate_window_ms` that count as a spike.
    pub spike_threshold: usize,
    /// High/critical errors within `severe_window_ms` that count as a cluster.
    pub severe_cluster_threshold: usize,
    /// Window for severe-cluster detection, in milliseconds.
    pub severe_window_ms: u64,
    /// Multiplier applied to reconnection delays while escalated.
    pub escalation_backoff_factor: f64,
    /// Cap on escalated reconnection delays, in milliseconds.
    pub escalated_max_delay_ms: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            server_url: "tcp://127.0.0.1:7777".to_string(),
            connect_timeout_ms: 10_000,
            message_timeout_ms: 5_000,
            verify_certificates: true,
            auth_token: None,
            headers: HashMap::new(),
            inbound_buffer: 1024,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 10,
            base_delay_ms: 1_000,
            backoff_factor: 2.0,
            max_delay_ms: 30_000,
            strategy: BackoffStrategy::ExponentialJitter,
            jitter_min: 0.8,
            jitter_max: 1.2,
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            ping_type: "ping".to_string(),
            pong_type: "pong".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_rate_threshold: 0.5,
            window_size: 20,
            minimum_calls: 10,
            cooldown_ms: 30_000,
        }
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self {
            log_capacity: 100,
            verbose: false,
            notification_cooldown_ms: 5_000,
            consecutive_threshold: 10,
            rate_threshold: 20,
            rate_window_ms: 60_000,
            spike_threshold: 8,
            severe_cluster_threshold: 3,
            severe_window_ms: 30_000,
            escalation_backoff_factor: 2.0,
            escalated_max_delay_ms: 120_000,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Duration accessors ---

impl ConnectionConfig {
    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Reply timeout as a [`Duration`].
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

impl ReconnectConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

impl ErrorConfig {
    pub fn notification_cooldown(&self) -> Duration {
        Duration::from_millis(self.notification_cooldown_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    pub fn severe_window(&self) -> Duration {
        Duration::from_millis(self.severe_window_ms)
    }

    pub fn escalated_max_delay(&self) -> Duration {
        Duration::from_millis(self.escalated_max_delay_ms)
    }
}

// --- Validation ---

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl ReconnectConfig {
    /// Check the backoff parameters in isolation. Used when auto-reconnect is
    /// re-enabled at runtime with a fresh config.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(invalid("reconnect.max_attempts", "must be at least 1"));
        }
        if self.base_delay_ms == 0 {
            return Err(invalid("reconnect.base_delay_ms", "must be positive"));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(invalid(
                "reconnect.max_delay_ms",
                format!(
                    "{} is smaller than base_delay_ms {}",
                    self.max_delay_ms, self.base_delay_ms
                ),
            ));
        }
        if !(self.backoff_factor >= 1.0 && self.backoff_factor.is_finite()) {
            return Err(invalid("reconnect.backoff_factor", "must be a finite value >= 1.0"));
        }
        if !(self.jitter_min > 0.0 && self.jitter_min <= self.jitter_max && self.jitter_max.is_finite())
        {
            return Err(invalid(
                "reconnect.jitter_min",
                "jitter bounds must satisfy 0 < jitter_min <= jitter_max",
            ));
        }
        Ok(())
    }
}

impl Config {
    /// Check every setting the connection engine depends on.
    ///
    /// Has no side effects; the first offending field is reported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let conn = &self.connection;
        if conn.server_url.trim().is_empty() {
            return Err(invalid("connection.server_url", "must not be empty"));
        }
        if conn.connect_timeout_ms == 0 {
            return Err(invalid("connection.connect_timeout_ms", "must be positive"));
        }
        if conn.message_timeout_ms == 0 {
            return Err(invalid("connection.message_timeout_ms", "must be positive"));
        }
        if conn.inbound_buffer == 0 {
            return Err(invalid("connection.inbound_buffer", "must be positive"));
        }

        self.reconnect.validate()?;

        if self.heartbeat.enabled && self.heartbeat.interval_ms == 0 {
            return Err(invalid("heartbeat.interval_ms", "must be positive when enabled"));
        }
        if self.heartbeat.ping_type.is_empty() || self.heartbeat.pong_type.is_empty() {
            return Err(invalid("heartbeat.ping_type", "ping/pong type tags must not be empty"));
        }

        if self.queue.enabled && self.queue.max_size == 0 {
            return Err(invalid("queue.max_size", "must be positive when enabled"));
        }

        let breaker = &self.breaker;
        if breaker.failure_threshold == 0 {
            return Err(invalid("breaker.failure_threshold", "must be at least 1"));
        }
        if !(breaker.failure_rate_threshold > 0.0 && breaker.failure_rate_threshold <= 1.0) {
            return Err(invalid("breaker.failure_rate_threshold", "must be in (0.0, 1.0]"));
        }
        if breaker.window_size == 0 || breaker.minimum_calls > breaker.window_size {
            return Err(invalid(
                "breaker.minimum_calls",
                "window_size must be positive and at least minimum_calls",
            ));
        }
        if breaker.cooldown_ms == 0 {
            return Err(invalid("breaker.cooldown_ms", "must be positive"));
        }

        let errors = &self.errors;
        if errors.log_capacity == 0 {
            return Err(invalid("errors.log_capacity", "must be positive"));
        }
        if errors.escalation_backoff_factor < 1.0 {
            return Err(invalid("errors.escalation_backoff_factor", "must be >= 1.0"));
        }

        Ok(())
    }
}

// --- Load / Save / Reload ---

impl Config {
    /// Default config directory: `<platform config dir>/tether`.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tether"))
    }

    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
