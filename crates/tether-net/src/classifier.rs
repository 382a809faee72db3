//! Fault classification.
//!
//! Every raw failure (socket errors, timeouts, HTTP-style status codes, close
//! codes, free-form text) is mapped onto a fixed [`ErrorKind`] taxonomy with a
//! [`Severity`], a recoverability flag and a user-facing message. The
//! classifier is pure: it records nothing and logs nothing, so callers decide
//! what to do with the resulting [`ErrorRecord`].

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::message::now_ms;

/// Fixed taxonomy of connection-related failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorKind {
    ConnectionFailed,
    Timeout,
    AuthenticationFailed,
    AuthorizationFailed,
    HttpError,
    SocketError,
    DnsResolutionFailed,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    ServerError,
    InvalidRequest,
    NotFound,
    ProtocolError,
    TemporaryUnavailable,
    Unknown,
}

/// How badly a failure affects the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// High and Critical failures count towards severe-cluster detection.
    pub fn is_severe(self) -> bool {
        self >= Severity::High
    }
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 16] = [
        ErrorKind::ConnectionFailed,
        ErrorKind::Timeout,
        ErrorKind::AuthenticationFailed,
        ErrorKind::AuthorizationFailed,
        ErrorKind::HttpError,
        ErrorKind::SocketError,
        ErrorKind::DnsResolutionFailed,
        ErrorKind::NetworkUnreachable,
        ErrorKind::HostUnreachable,
        ErrorKind::ConnectionRefused,
        ErrorKind::ServerError,
        ErrorKind::InvalidRequest,
        ErrorKind::NotFound,
        ErrorKind::ProtocolError,
        ErrorKind::TemporaryUnavailable,
        ErrorKind::Unknown,
    ];

    /// Whether retrying can plausibly succeed without user action.
    pub fn is_recoverable(self) -> bool {
        !matches!(
            self,
            ErrorKind::AuthenticationFailed
                | ErrorKind::AuthorizationFailed
                | ErrorKind::InvalidRequest
                | ErrorKind::NotFound
        )
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorKind::AuthenticationFailed | ErrorKind::AuthorizationFailed => Severity::Critical,
            ErrorKind::ServerError
            | ErrorKind::DnsResolutionFailed
            | ErrorKind::NetworkUnreachable
            | ErrorKind::HostUnreachable
            | ErrorKind::ProtocolError => Severity::High,
            ErrorKind::ConnectionFailed
            | ErrorKind::Timeout
            | ErrorKind::ConnectionRefused
            | ErrorKind::SocketError
            | ErrorKind::HttpError
            | ErrorKind::Unknown => Severity::Medium,
            ErrorKind::TemporaryUnavailable | ErrorKind::InvalidRequest | ErrorKind::NotFound => {
                Severity::Low
            }
        }
    }

    /// Player-facing description of the failure.
    pub fn user_message(self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "Lost connection to the game server.",
            ErrorKind::Timeout => "The game server is taking too long to respond.",
            ErrorKind::AuthenticationFailed => {
                "Your session could not be verified. Please sign in again."
            }
            ErrorKind::AuthorizationFailed => "You do not have permission to join this server.",
            ErrorKind::HttpError => "The game server returned an unexpected response.",
            ErrorKind::SocketError => "A network error interrupted the connection.",
            ErrorKind::DnsResolutionFailed => "The game server address could not be found.",
            ErrorKind::NetworkUnreachable => "No network connection. Check your internet access.",
            ErrorKind::HostUnreachable => "The game server cannot be reached right now.",
            ErrorKind::ConnectionRefused => "The game server refused the connection.",
            ErrorKind::ServerError => "The game server ran into a problem.",
            ErrorKind::InvalidRequest => "The game server rejected the request.",
            ErrorKind::NotFound => "The requested game resource does not exist.",
            ErrorKind::ProtocolError => "Received data the client could not understand.",
            ErrorKind::TemporaryUnavailable => "The game server is busy. Please wait a moment.",
            ErrorKind::Unknown => "An unexpected connection problem occurred.",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::ConnectionFailed => "connection_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::AuthenticationFailed => "authentication_failed",
            ErrorKind::AuthorizationFailed => "authorization_failed",
            ErrorKind::HttpError => "http_error",
            ErrorKind::SocketError => "socket_error",
            ErrorKind::DnsResolutionFailed => "dns_resolution_failed",
            ErrorKind::NetworkUnreachable => "network_unreachable",
            ErrorKind::HostUnreachable => "host_unreachable",
            ErrorKind::ConnectionRefused => "connection_refused",
            ErrorKind::ServerError => "server_error",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::NotFound => "not_found",
            ErrorKind::ProtocolError => "protocol_error",
            ErrorKind::TemporaryUnavailable => "temporary_unavailable",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw failure as reported by a transport, a timer or the engine itself.
#[derive(Debug, thiserror::Error)]
pub enum Fault {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("could not resolve {host}: {reason}")]
    Dns { host: String, reason: String },

    /// Status-coded rejection, e.g. from an HTTP upgrade or auth handshake.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("connection closed with code {code}: {reason}")]
    Closed { code: u16, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("invalid server address: {0}")]
    InvalidAddress(String),

    #[error("{0}")]
    Other(String),
}

/// Where a failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: String,
    pub attempt: Option<u32>,
    pub details: BTreeMap<String, String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = Some(attempt);
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

/// Immutable result of classifying one failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorRecord {
    pub id: u64,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    pub kind: ErrorKind,
    pub severity: Severity,
    /// Player-facing text; includes technical detail in verbose mode.
    pub message: String,
    /// The raw fault rendered as text.
    pub technical: String,
    pub recoverable: bool,
    pub context: ErrorContext,
}

/// Maps raw faults onto [`ErrorRecord`]s.
#[derive(Debug, Default)]
pub struct ErrorClassifier {
    verbose: bool,
    next_id: AtomicU64,
}

impl ErrorClassifier {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            next_id: AtomicU64::new(0),
        }
    }

    pub fn classify(&self, fault: &Fault, context: ErrorContext) -> ErrorRecord {
        let kind = kind_of(fault);
        let technical = fault.to_string();
        let message = if self.verbose {
            format!("{} ({technical})", kind.user_message())
        } else {
            kind.user_message().to_string()
        };

        ErrorRecord {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
            timestamp_ms: now_ms(),
            kind,
            severity: kind.severity(),
            message,
            technical,
            recoverable: kind.is_recoverable(),
            context,
        }
    }
}

/// Determine the [`ErrorKind`] of a raw fault.
pub fn kind_of(fault: &Fault) -> ErrorKind {
    match fault {
        Fault::Io(e) => io_kind(e),
        Fault::Timeout { .. } => ErrorKind::Timeout,
        Fault::Dns { .. } => ErrorKind::DnsResolutionFailed,
        Fault::Http { status, .. } => status_kind(*status),
        Fault::Closed { code, .. } => close_code_kind(*code),
        Fault::Protocol(_) => ErrorKind::ProtocolError,
        Fault::InvalidAddress(_) => ErrorKind::InvalidRequest,
        Fault::Other(text) => text_kind(text),
    }
}

fn io_kind(e: &io::Error) -> ErrorKind {
    use io::ErrorKind as Io;
    match e.kind() {
        Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
        Io::ConnectionRefused => ErrorKind::ConnectionRefused,
        Io::ConnectionReset | Io::ConnectionAborted | Io::BrokenPipe | Io::UnexpectedEof => {
            ErrorKind::ConnectionFailed
        }
        Io::NetworkUnreachable | Io::NetworkDown => ErrorKind::NetworkUnreachable,
        Io::HostUnreachable => ErrorKind::HostUnreachable,
        Io::InvalidData => ErrorKind::ProtocolError,
        Io::NotConnected | Io::AddrInUse | Io::AddrNotAvailable => ErrorKind::SocketError,
        _ => match text_kind(&e.to_string()) {
            ErrorKind::Unknown => ErrorKind::SocketError,
            kind => kind,
        },
    }
}

/// Map an HTTP-style status code.
pub fn status_kind(status: u16) -> ErrorKind {
    match status {
        401 => ErrorKind::AuthenticationFailed,
        403 => ErrorKind::AuthorizationFailed,
        404 | 410 => ErrorKind::NotFound,
        408 | 504 => ErrorKind::Timeout,
        429 | 503 => ErrorKind::TemporaryUnavailable,
        400..=499 => ErrorKind::InvalidRequest,
        500..=599 => ErrorKind::ServerError,
        _ => ErrorKind::HttpError,
    }
}

/// Map a connection close code (WebSocket numbering; 4xxx are application codes).
pub fn close_code_kind(code: u16) -> ErrorKind {
    match code {
        1002 | 1003 | 1007 | 1009 | 1010 => ErrorKind::ProtocolError,
        1008 => ErrorKind::AuthorizationFailed,
        1011 => ErrorKind::ServerError,
        1012 | 1013 => ErrorKind::TemporaryUnavailable,
        1015 => ErrorKind::SocketError,
        4001 => ErrorKind::AuthenticationFailed,
        4003 => ErrorKind::AuthorizationFailed,
        4004 => ErrorKind::NotFound,
        _ => ErrorKind::ConnectionFailed,
    }
}

/// Keyword fallback for free-form failure text. Order matters: more specific
/// phrases are checked first.
pub fn text_kind(text: &str) -> ErrorKind {
    let text = text.to_ascii_lowercase();
    let has = |needles: &[&str]| needles.iter().any(|n| text.contains(n));

    if has(&["timed out", "timeout"]) {
        ErrorKind::Timeout
    } else if has(&["refused"]) {
        ErrorKind::ConnectionRefused
    } else if has(&["network is unreachable", "network unreachable", "network down"]) {
        ErrorKind::NetworkUnreachable
    } else if has(&["host unreachable", "host is unreachable", "no route to host"]) {
        ErrorKind::HostUnreachable
    } else if has(&["dns", "resolve", "name or service not known", "no such host"]) {
        ErrorKind::DnsResolutionFailed
    } else if has(&["401", "unauthorized", "unauthenticated", "invalid token"]) {
        ErrorKind::AuthenticationFailed
    } else if has(&["403", "forbidden", "permission denied"]) {
        ErrorKind::AuthorizationFailed
    } else if has(&["404", "not found"]) {
        ErrorKind::NotFound
    } else if has(&["503", "unavailable", "try again", "overloaded"]) {
        ErrorKind::TemporaryUnavailable
    } else if has(&["500", "internal server error"]) {
        ErrorKind::ServerError
    } else if has(&["protocol", "malformed", "invalid frame"]) {
        ErrorKind::ProtocolError
    } else if has(&["socket"]) {
        ErrorKind::SocketError
    } else if has(&["connection", "disconnected", "reset by peer"]) {
        ErrorKind::ConnectionFailed
    } else {
        ErrorKind::Unknown
    }
}
