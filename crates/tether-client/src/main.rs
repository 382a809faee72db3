//! Headless Tether client.
//!
//! Loads `config.ron` (created with defaults on first run), applies CLI
//! overrides, connects to the configured game server over TCP and logs every
//! connection event until interrupted with Ctrl-C.
//!
//! Run with `cargo run -p tether-client -- --server tcp://127.0.0.1:7777`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tether_config::{CliArgs, Config};
use tether_net::{ConnectionEvent, ConnectionManager, HandlerResult, Message, TcpTransport};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};

fn config_dir(args: &CliArgs) -> PathBuf {
    args.config
        .clone()
        .or_else(Config::default_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

fn log_chat(msg: &Message) -> HandlerResult {
    let from = msg.payload.get("from").and_then(|v| v.as_str()).unwrap_or("?");
    let text = msg.payload.get("text").and_then(|v| v.as_str()).unwrap_or_default();
    info!(from, text, "Chat");
    Ok(())
}

fn log_game_state(msg: &Message) -> HandlerResult {
    info!(action = ?msg.action, bytes = msg.payload.to_string().len(), "Game state");
    Ok(())
}

/// Log events until the channel closes.
async fn watch_events(manager: ConnectionManager) {
    let mut events = manager.subscribe();
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Event log fell behind");
                continue;
            }
            Err(RecvError::Closed) => return,
        };
        match event {
            ConnectionEvent::Connected => info!("Connected"),
            ConnectionEvent::Disconnected { reason } => info!(%reason, "Disconnected"),
            ConnectionEvent::StatusChanged { from, to } => info!(%from, %to, "Status"),
            ConnectionEvent::ReconnectAttempt { attempt, delay } => {
                info!(attempt, ?delay, "Reconnecting")
            }
            ConnectionEvent::Notice { kind, message } => warn!(%kind, "{message}"),
            ConnectionEvent::Escalated(pattern) => error!(%pattern, "Connection unstable"),
            ConnectionEvent::UnknownMessage { msg_type } => warn!(%msg_type, "Unhandled message"),
            ConnectionEvent::DispatchFailed(failure) => {
                warn!(msg_type = %failure.msg_type, reason = %failure.reason, "Handler failed")
            }
            // Already logged by the connection engine.
            ConnectionEvent::Error(_) | ConnectionEvent::MessageReceived(_) => {}
        }
    }
}

#[tokio::main]
async fn main() {
    let args = CliArgs::parse();
    let config_dir = config_dir(&args);

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    tether_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    let transport = Arc::new(TcpTransport::from_config(&config));
    let manager = match ConnectionManager::initialize(config, transport) {
        Ok(manager) => manager,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(2);
        }
    };
    manager.register_handler("chat", log_chat);
    manager.register_handler("game_state", log_game_state);

    let watcher = tokio::spawn(watch_events(manager.clone()));

    info!(server = %manager.config().connection.server_url, "Starting Tether client");
    if let Err(e) = manager.connect().await {
        // Recoverable failures keep retrying in the background.
        warn!(error = %e, "Initial connection failed");
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
    }

    info!("Shutting down");
    let stats = manager.statistics();
    info!(
        sent = stats.messages_sent,
        received = stats.messages_received,
        errors = stats.errors,
        reconnections = stats.reconnections,
        "Session statistics"
    );
    manager.shutdown().await;
    watcher.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_config_dir_prefers_cli_path() {
        let args = CliArgs::parse_from(["tether", "--config", "/tmp/tether-test"]);
        assert_eq!(config_dir(&args), PathBuf::from("/tmp/tether-test"));
    }

    #[test]
    fn test_handlers_accept_sparse_payloads() {
        assert!(log_chat(&Message::new("chat", json!({}))).is_ok());
        assert!(log_game_state(&Message::new("game_state", json!(null))).is_ok());
    }
}
