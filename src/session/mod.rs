//! The single session to the messaging network.
//!
//! [`ConnectionSupervisor`] drives a [`Connector`] (the sidecar bridge in
//! production), persists credentials through a [`CredentialStorage`], and
//! feeds filtered inbound text to the command dispatcher.

pub mod backoff;
pub mod bridge;
pub mod storage;
pub mod supervisor;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use bridge::BridgeConnector;
pub use storage::{CredentialStorage, FileCredentialStorage, MemoryCredentialStorage};
pub use supervisor::{
    ConnectionState, ConnectionSupervisor, InboundText, SupervisorEvent, SupervisorOptions,
};
pub use transport::{
    Connector, Credentials, DisconnectReason, LinkEvent, MessageBody, OutgoingMessage, RawMessage,
    SessionLink,
};
