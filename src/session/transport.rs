//! Boundary to the external messaging library.
//!
//! A [`Connector`] opens one session at a time and hands back the
//! [`SessionLink`] used for sending plus a stream of [`LinkEvent`]s. The
//! handshake, encryption and wire framing all live behind this boundary.

use std::fmt;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use crate::error::{SendError, SessionError};

/// Opaque authentication material owned by the messaging library.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials(Vec<u8>);

impl Credentials {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credentials([REDACTED; {} bytes])", self.0.len())
    }
}

/// Why a session closed, with the library's status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The account unlinked this device. Never reconnect.
    LoggedOut,
    ConnectionClosed,
    ConnectionLost,
    ConnectionReplaced,
    TimedOut,
    BadSession,
    RestartRequired,
    Other(u16),
    Unknown,
}

impl DisconnectReason {
    pub fn from_status_code(code: Option<u16>) -> Self {
        match code {
            Some(401) => Self::LoggedOut,
            Some(428) => Self::ConnectionClosed,
            Some(408) => Self::TimedOut,
            Some(440) => Self::ConnectionReplaced,
            Some(500) => Self::BadSession,
            Some(515) => Self::RestartRequired,
            Some(503) => Self::ConnectionLost,
            Some(other) => Self::Other(other),
            None => Self::Unknown,
        }
    }

    pub fn status_code(self) -> Option<u16> {
        match self {
            Self::LoggedOut => Some(401),
            Self::ConnectionClosed => Some(428),
            Self::TimedOut => Some(408),
            Self::ConnectionReplaced => Some(440),
            Self::BadSession => Some(500),
            Self::RestartRequired => Some(515),
            Self::ConnectionLost => Some(503),
            Self::Other(code) => Some(code),
            Self::Unknown => None,
        }
    }

    /// Whether the session can be restored by reconnecting.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, Self::LoggedOut)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::LoggedOut => "logged out",
            Self::ConnectionClosed => "connection closed",
            Self::ConnectionLost => "connection lost",
            Self::ConnectionReplaced => "connection replaced",
            Self::TimedOut => "timed out",
            Self::BadSession => "bad session",
            Self::RestartRequired => "restart required",
            Self::Other(_) => "other",
            Self::Unknown => "unknown",
        };
        match self.status_code() {
            Some(code) => write!(f, "{name} ({code})"),
            None => f.write_str(name),
        }
    }
}

/// Body of an inbound message, as far as this bot cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    /// Plain conversation text.
    Conversation(String),
    /// Text of a rich (quoted, linked, forwarded) message.
    ExtendedText(String),
    /// Anything without a text body: media, reactions, receipts.
    Unsupported,
}

impl MessageBody {
    pub fn plain_text(&self) -> Option<&str> {
        match self {
            Self::Conversation(text) | Self::ExtendedText(text) if !text.is_empty() => {
                Some(text)
            }
            _ => None,
        }
    }
}

/// A message as delivered by the messaging library.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Network address of the chat, e.g. `15551234567@s.whatsapp.net`.
    pub remote_address: String,
    /// Set when this account sent the message.
    pub from_me: bool,
    pub body: MessageBody,
}

/// Events emitted by an open link.
#[derive(Debug)]
pub enum LinkEvent {
    /// Handshake finished; the link can send.
    Open {
        /// Address of the logged-in account, when known.
        self_address: Option<String>,
    },
    /// The library rotated its credentials. Answer `ack` once they are durable.
    CredentialsUpdated {
        credentials: Credentials,
        ack: Option<oneshot::Sender<bool>>,
    },
    Message(RawMessage),
    Closed(DisconnectReason),
}

/// Outgoing text with optional attribution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub text: String,
    /// Render the message as forwarded.
    pub forwarded: bool,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            forwarded: false,
        }
    }
}

/// Sending half of an open session.
#[async_trait]
pub trait SessionLink: Send + Sync {
    /// Send a message to a network address.
    async fn send(&self, address: &str, message: &OutgoingMessage) -> Result<(), SendError>;

    /// Tear the link down. Further sends fail.
    async fn close(&self);
}

/// Opens sessions with the messaging library.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Start a session, restoring `credentials` when present.
    ///
    /// Returns once the transport is up; the handshake result arrives as a
    /// [`LinkEvent::Open`] or [`LinkEvent::Closed`] on the event stream.
    async fn connect(
        &self,
        credentials: Option<Credentials>,
    ) -> Result<(std::sync::Arc<dyn SessionLink>, mpsc::Receiver<LinkEvent>), SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logged_out_is_not_recoverable() {
        let reason = DisconnectReason::from_status_code(Some(401));
        assert_eq!(reason, DisconnectReason::LoggedOut);
        assert!(!reason.is_recoverable());
    }

    #[test]
    fn test_other_reasons_are_recoverable() {
        for code in [Some(408), Some(428), Some(440), Some(500), Some(515), Some(999), None] {
            assert!(DisconnectReason::from_status_code(code).is_recoverable());
        }
    }

    #[test]
    fn test_status_code_round_trip() {
        for code in [401, 408, 428, 440, 500, 503, 515, 777] {
            assert_eq!(
                DisconnectReason::from_status_code(Some(code)).status_code(),
                Some(code)
            );
        }
        assert_eq!(DisconnectReason::Unknown.status_code(), None);
    }

    #[test]
    fn test_display_includes_code() {
        assert_eq!(DisconnectReason::LoggedOut.to_string(), "logged out (401)");
        assert_eq!(DisconnectReason::Unknown.to_string(), "unknown");
    }

    #[test]
    fn test_plain_text_extraction() {
        assert_eq!(
            MessageBody::Conversation(".ping".into()).plain_text(),
            Some(".ping")
        );
        assert_eq!(
            MessageBody::ExtendedText("hi".into()).plain_text(),
            Some("hi")
        );
        assert_eq!(MessageBody::Conversation(String::new()).plain_text(), None);
        assert_eq!(MessageBody::Unsupported.plain_text(), None);
    }

    #[test]
    fn test_credentials_debug_is_redacted() {
        let creds = Credentials::new(b"secret-key".to_vec());
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("10 bytes"));
    }
}
