//! Structured error types for gatelink
//!
//! One error enum covers the transport, execution and resilience layers.
//! Retry decisions go through the [`Retryable`] trait rather than string
//! matching: every error reports an [`ErrorKind`], and foreign error types
//! get a default classification from the table at the bottom of this file.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Primary error type for gateway operations
#[derive(Error, Debug)]
pub enum GatewayError {
    // =========================================================================
    // Transport / Protocol Errors
    // =========================================================================
    /// Handshake failed (missing challenge, rejected connect, bad hello-ok)
    #[error("handshake failed: {reason}")]
    Handshake { reason: String },

    /// Protocol version offered by the server is outside our range
    #[error("protocol mismatch: server speaks {server}, client supports {min}..={max}")]
    ProtocolMismatch { server: u32, min: u32, max: u32 },

    /// A frame could not be decoded or was not valid for the current state
    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },

    /// The method is not known to the transport
    #[error("unknown method: {method}")]
    UnknownMethod { method: String },

    /// Socket could not be opened or failed mid-flight
    #[error("connection failed: {message}")]
    ConnectionFailed { message: String },

    /// Connection was closed while the operation was outstanding
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// Operation requires a live connection
    #[error("not connected")]
    NotConnected,

    /// A live connection already exists for this channel
    #[error("already connected")]
    AlreadyConnected,

    /// Capability not offered by this transport
    #[error("not supported: {feature}")]
    NotSupported { feature: String },

    // =========================================================================
    // Remote Errors
    // =========================================================================
    /// The gateway answered the request with an error
    #[error("gateway error {code}: {message}")]
    Remote {
        code: String,
        message: String,
        retryable: Option<bool>,
        retry_after: Option<Duration>,
    },

    /// Authentication/authorization was refused
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// Gateway asked us to slow down
    #[error("rate limited by gateway")]
    RateLimited { retry_after: Option<Duration> },

    /// Gateway is temporarily unavailable (5xx)
    #[error("gateway unavailable: {message}")]
    Unavailable { message: String },

    // =========================================================================
    // Deadline Errors
    // =========================================================================
    /// A single call exceeded its timeout
    #[error("call {method} timed out after {timeout:?}")]
    CallTimeout { method: String, timeout: Duration },

    /// A whole execution exceeded its deadline
    #[error("execution {} exceeded deadline of {deadline:?}", .run_id.as_deref().unwrap_or("<pending>"))]
    ExecutionTimeout {
        run_id: Option<String>,
        deadline: Duration,
    },

    // =========================================================================
    // Execution / Resilience Errors
    // =========================================================================
    /// The remote run finished with an error
    #[error("execution {} failed: {message}", .run_id.as_deref().unwrap_or("<unknown>"))]
    Execution {
        run_id: Option<String>,
        message: String,
    },

    /// Circuit breaker is open and rejected the call
    #[error("circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    /// Identical request already in flight within the dedup window
    #[error("duplicate request suppressed: {method}")]
    DuplicateRequest { method: String },

    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// No transport could be built or the configuration is unusable
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Device signer refused or failed to sign the challenge
    #[error("signing failed: {message}")]
    Signing { message: String },

    // =========================================================================
    // External Error Wrappers
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification used by retry policies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Socket/network level failure
    Transport,
    /// Handshake, framing or unknown-method failures
    Protocol,
    /// Credentials refused
    Auth,
    /// Per-call deadline exceeded
    Timeout,
    /// Per-execution deadline exceeded
    ExecutionTimeout,
    /// Connection went away under the caller
    ConnectionClosed,
    /// Breaker rejected the call
    CircuitOpen,
    /// Remote run failed
    Execution,
    /// Gateway rate limited the caller
    RateLimited,
    /// Gateway reported a transient failure
    Unavailable,
    /// Gateway reported a non-transient failure
    Remote,
    /// Suppressed by the deduplicator
    Duplicate,
    /// Capability missing on this transport
    Unsupported,
    /// Unusable configuration
    Configuration,
    /// Anything else
    Other,
}

impl ErrorKind {
    /// Default retryability when no policy overrides it
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            Self::Transport
                | Self::Timeout
                | Self::ConnectionClosed
                | Self::RateLimited
                | Self::Unavailable
        )
    }

    /// Kinds retried by a default [`crate::resilience::RetryPolicy`]
    pub fn default_retryable_set() -> Vec<ErrorKind> {
        [
            Self::Transport,
            Self::Timeout,
            Self::ConnectionClosed,
            Self::RateLimited,
            Self::Unavailable,
        ]
        .to_vec()
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Transport => "transport",
            Self::Protocol => "protocol",
            Self::Auth => "auth",
            Self::Timeout => "timeout",
            Self::ExecutionTimeout => "execution_timeout",
            Self::ConnectionClosed => "connection_closed",
            Self::CircuitOpen => "circuit_open",
            Self::Execution => "execution",
            Self::RateLimited => "rate_limited",
            Self::Unavailable => "unavailable",
            Self::Remote => "remote",
            Self::Duplicate => "duplicate",
            Self::Unsupported => "unsupported",
            Self::Configuration => "configuration",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

/// Capability interface for retry classification
///
/// Implemented by [`GatewayError`] and, through a default table, by the
/// foreign error types that commonly surface from wrapped operations.
pub trait Retryable {
    /// Classification of this error
    fn error_kind(&self) -> ErrorKind;

    /// Standalone retryability, without any policy
    fn is_retryable(&self) -> bool {
        self.error_kind().default_retryable()
    }

    /// Server-suggested delay, when one was provided
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

impl GatewayError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Handshake { .. }
            | Self::ProtocolMismatch { .. }
            | Self::MalformedFrame { .. }
            | Self::UnknownMethod { .. } => ErrorKind::Protocol,
            Self::ConnectionFailed { .. } => ErrorKind::Transport,
            Self::ConnectionClosed { .. } | Self::NotConnected => ErrorKind::ConnectionClosed,
            Self::AlreadyConnected => ErrorKind::Other,
            Self::NotSupported { .. } => ErrorKind::Unsupported,
            Self::Remote { code, retryable, .. } => {
                if is_auth_code(code) {
                    ErrorKind::Auth
                } else if retryable.unwrap_or(false) {
                    ErrorKind::Unavailable
                } else {
                    ErrorKind::Remote
                }
            }
            Self::Unauthorized { .. } | Self::Signing { .. } => ErrorKind::Auth,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::Unavailable { .. } => ErrorKind::Unavailable,
            Self::CallTimeout { .. } => ErrorKind::Timeout,
            Self::ExecutionTimeout { .. } => ErrorKind::ExecutionTimeout,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::DuplicateRequest { .. } => ErrorKind::Duplicate,
            Self::Config { .. } => ErrorKind::Configuration,
            Self::Io(err) => io_kind(err),
            Self::Json(_) => ErrorKind::Protocol,
            Self::Internal { .. } => ErrorKind::Other,
        }
    }

    /// Get suggested retry delay for retryable errors
    pub fn retry_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            Self::Remote { retry_after, .. } => *retry_after,
            Self::CircuitOpen { retry_after } => Some(*retry_after),
            _ => None,
        }
    }

    /// Check if error requires user action
    pub fn requires_user_action(&self) -> bool {
        matches!(self.kind(), ErrorKind::Auth | ErrorKind::Configuration)
    }

    /// Shorthand for a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Shorthand for a malformed frame
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Shorthand for a closed connection
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }
}

impl Retryable for GatewayError {
    fn error_kind(&self) -> ErrorKind {
        self.kind()
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_delay()
    }
}

fn is_auth_code(code: &str) -> bool {
    let code = code.to_ascii_uppercase();
    code.contains("UNAUTHORIZED") || code.contains("FORBIDDEN") || code.starts_with("AUTH")
}

fn io_kind(err: &std::io::Error) -> ErrorKind {
    use std::io::ErrorKind as Io;
    match err.kind() {
        Io::TimedOut | Io::WouldBlock => ErrorKind::Timeout,
        Io::Interrupted
        | Io::ConnectionRefused
        | Io::ConnectionReset
        | Io::ConnectionAborted
        | Io::NotConnected
        | Io::BrokenPipe
        | Io::UnexpectedEof => ErrorKind::Transport,
        Io::PermissionDenied => ErrorKind::Auth,
        Io::InvalidData | Io::InvalidInput => ErrorKind::Protocol,
        _ => ErrorKind::Other,
    }
}

// =============================================================================
// Default classification for foreign error types
// =============================================================================

impl Retryable for std::io::Error {
    fn error_kind(&self) -> ErrorKind {
        io_kind(self)
    }
}

impl Retryable for serde_json::Error {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::Protocol
    }
}

impl Retryable for tokio::time::error::Elapsed {
    fn error_kind(&self) -> ErrorKind {
        ErrorKind::Timeout
    }
}

impl Retryable for reqwest::Error {
    fn error_kind(&self) -> ErrorKind {
        if self.is_timeout() {
            return ErrorKind::Timeout;
        }
        if self.is_connect() || self.is_request() {
            return ErrorKind::Transport;
        }
        match self.status().map(|s| s.as_u16()) {
            Some(401) | Some(403) => ErrorKind::Auth,
            Some(429) => ErrorKind::RateLimited,
            Some(s) if s >= 500 => ErrorKind::Unavailable,
            Some(_) => ErrorKind::Remote,
            None if self.is_decode() => ErrorKind::Protocol,
            None => ErrorKind::Other,
        }
    }
}

impl Retryable for tokio_tungstenite::tungstenite::Error {
    fn error_kind(&self) -> ErrorKind {
        use tokio_tungstenite::tungstenite::Error as Ws;
        match self {
            Ws::ConnectionClosed | Ws::AlreadyClosed => ErrorKind::ConnectionClosed,
            Ws::Io(err) => io_kind(err),
            Ws::Protocol(_) | Ws::Capacity(_) => ErrorKind::Protocol,
            Ws::Http(response) => match response.status().as_u16() {
                401 | 403 => ErrorKind::Auth,
                429 => ErrorKind::RateLimited,
                s if s >= 500 => ErrorKind::Unavailable,
                _ => ErrorKind::Protocol,
            },
            _ => ErrorKind::Transport,
        }
    }
}

impl Retryable for anyhow::Error {
    fn error_kind(&self) -> ErrorKind {
        if let Some(err) = self.downcast_ref::<GatewayError>() {
            return err.kind();
        }
        if let Some(err) = self.downcast_ref::<std::io::Error>() {
            return io_kind(err);
        }
        if self.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return ErrorKind::Timeout;
        }
        ErrorKind::Other
    }

    fn retry_after(&self) -> Option<Duration> {
        self.downcast_ref::<GatewayError>()
            .and_then(GatewayError::retry_delay)
    }
}

// =============================================================================
// Conversions
// =============================================================================

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as Ws;
        match err {
            Ws::ConnectionClosed | Ws::AlreadyClosed => Self::closed("websocket closed"),
            Ws::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
                Self::Unauthorized {
                    message: format!("gateway refused upgrade: {}", response.status()),
                }
            }
            other => Self::ConnectionFailed {
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        Self::ConnectionFailed {
            message: err.to_string(),
        }
    }
}

/// Convert from anyhow::Error to GatewayError
impl From<anyhow::Error> for GatewayError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<GatewayError>() {
            Ok(gateway) => gateway,
            Err(err) => {
                if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
                    return Self::Io(std::io::Error::new(io_err.kind(), io_err.to_string()));
                }
                Self::Internal {
                    message: err.to_string(),
                }
            }
        }
    }
}

impl From<crate::config::ConfigError> for GatewayError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config {
            message: err.to_string(),
        }
    }
}

/// Result type alias using GatewayError
pub type Result<T> = std::result::Result<T, GatewayError>;
