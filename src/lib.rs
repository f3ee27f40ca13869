//! pairbot: a chat bot that issues and verifies device-pairing codes.
//!
//! The bot keeps one session to a messaging network alive through a
//! [`session::ConnectionSupervisor`], answers prefix commands through a
//! [`commands::CommandDispatcher`], and serves `/code` and `/verify` over
//! HTTP. Pairing codes live in a [`pairing::CredentialStore`]; a verified
//! code adds the sender to the paired set that gates restricted commands.

pub mod clock;
pub mod commands;
pub mod config;
pub mod error;
pub mod http;
pub mod pairing;
pub mod session;

pub use config::BotConfig;
pub use error::{Error, Result};
