//! Canonical sender identities.
//!
//! The network addresses users as `15551234567@s.whatsapp.net` (sometimes
//! with a `:device` part), while the website sends `+1 555-123-4567`.
//! Both normalize to the same digits-only [`Identity`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::PairingError;

/// Suffix the network appends to personal chat addresses.
pub const USER_ADDRESS_SUFFIX: &str = "@s.whatsapp.net";

/// Canonical identity of a remote user: the phone number as plain digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Normalize a phone number or network address.
    ///
    /// Drops everything from the first `@` or `:`, then strips `+`, spaces,
    /// dashes, dots and parentheses. What remains must be 5 to 20 digits.
    pub fn parse(raw: &str) -> Result<Self, PairingError> {
        let local = raw
            .split(['@', ':'])
            .next()
            .unwrap_or_default()
            .trim();

        let digits: String = local
            .chars()
            .filter(|c| !matches!(c, '+' | ' ' | '-' | '.' | '(' | ')'))
            .collect();

        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(PairingError::InvalidIdentity(raw.to_string()));
        }
        if !(5..=20).contains(&digits.len()) {
            return Err(PairingError::InvalidIdentity(raw.to_string()));
        }
        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Network address for a direct chat with this identity.
    pub fn to_address(&self) -> String {
        format!("{}{}", self.0, USER_ADDRESS_SUFFIX)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
