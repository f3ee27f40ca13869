//! Pairing for chat senders.
//!
//! A sender proves control of a number by echoing a one-time code back to
//! the bot (or to `/verify`). Paired identities unlock gated commands.
//!
//! ```text
//! /code or .code  --> CodeIssuer --> PairingService::request_code --> CredentialStore::issue
//! .pair or /verify --> PairingService::confirm --> CredentialStore::verify --> paired set
//! gated command   --> PairingService::is_paired
//! ```

pub mod identity;
pub mod service;
pub mod store;
pub mod upstream;

pub use identity::Identity;
pub use service::{PairedIdentity, PairingService};
pub use store::{CredentialStore, PairingCode, spawn_sweeper};
pub use upstream::{CodeIssuer, UpstreamCodeClient};
