//! Error types for pairbot.

use std::time::Duration;

/// Top-level error type for the bot.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Send error: {0}")]
    Send(#[from] SendError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Pairing-code lifecycle errors.
///
/// These are never fatal: callers turn them into a chat reply or an HTTP
/// JSON field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PairingError {
    #[error("pairing code not found or already used")]
    CodeNotFound,

    #[error("pairing code has expired")]
    CodeExpired,

    #[error("pairing code was issued for a different number")]
    IdentityMismatch,

    #[error("invalid number: {0}")]
    InvalidIdentity(String),

    #[error("no free pairing code available, try again shortly")]
    CodeSpaceExhausted,

    #[error("malformed pairing code: {0}")]
    MalformedCode(String),

    #[error("pairing code is already in use")]
    CodeInUse,

    #[error("upstream code service unavailable: {reason}")]
    UpstreamUnavailable { reason: String },
}

/// Errors raised by the connection supervisor.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connection lost: {reason}")]
    ConnectionLost { reason: String },

    #[error("Session logged out; re-pairing required")]
    LoggedOut,

    #[error("Gave up reconnecting after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },

    #[error("Failed to open session: {reason}")]
    ConnectFailed { reason: String },

    #[error("Credential storage failed: {0}")]
    Storage(#[from] StorageError),
}

/// Errors returned when sending a reply over the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("session is not open")]
    NotConnected,

    #[error("send timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("send failed: {cause}")]
    SendFailed { cause: String },
}

/// Errors from the session credential storage collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt credential data: {0}")]
    Corrupt(String),
}

/// HTTP server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("HTTP server failed to start: {reason}")]
    StartupFailed { reason: String },
}

/// Result type alias for the bot.
pub type Result<T> = std::result::Result<T, Error>;
