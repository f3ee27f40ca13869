//! Pairing service: code issuance, confirmation and the paired-identity set.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::PairingError;
use crate::pairing::identity::Identity;
use crate::pairing::store::CredentialStore;

/// An identity that proved control of its number with a pairing code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PairedIdentity {
    pub identity: Identity,
    pub paired_at: DateTime<Utc>,
}

/// Wraps the [`CredentialStore`] and tracks which identities are paired.
///
/// Paired identities never expire and are held in memory only, so a restart
/// forgets them.
pub struct PairingService {
    store: Arc<CredentialStore>,
    paired: RwLock<HashMap<Identity, PairedIdentity>>,
    clock: Arc<dyn Clock>,
}

impl PairingService {
    pub fn new(store: Arc<CredentialStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            paired: RwLock::new(HashMap::new()),
            clock,
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Issue a code to be relayed to the user.
    pub async fn request_code(&self, identity: &Identity) -> Result<String, PairingError> {
        let issued = self.store.issue(identity).await?;
        tracing::info!(identity = %identity, "Pairing code requested");
        Ok(issued.code)
    }

    /// Record an externally issued code so it can be confirmed here.
    pub async fn register_code(
        &self,
        code: &str,
        identity: &Identity,
    ) -> Result<String, PairingError> {
        let recorded = self.store.issue_with_code(code, identity).await?;
        tracing::info!(identity = %identity, "Pairing code registered");
        Ok(recorded.code)
    }

    /// Consume `code` for `identity` and mark the identity as paired.
    ///
    /// Re-pairing an already paired identity keeps its original timestamp.
    pub async fn confirm(
        &self,
        code: &str,
        identity: &Identity,
    ) -> Result<PairedIdentity, PairingError> {
        if let Err(e) = self.store.verify(code.trim(), identity).await {
            tracing::info!(identity = %identity, error = %e, "Pairing confirmation rejected");
            return Err(e);
        }

        let now = self.clock.now();
        let mut paired = self.paired.write().await;
        let entry = paired
            .entry(identity.clone())
            .or_insert_with(|| PairedIdentity {
                identity: identity.clone(),
                paired_at: now,
            })
            .clone();

        tracing::info!(identity = %identity, "Identity paired");
        Ok(entry)
    }

    pub async fn is_paired(&self, identity: &Identity) -> bool {
        self.paired.read().await.contains_key(identity)
    }

    /// Remove an identity from the paired set. Returns whether it was paired.
    pub async fn unpair(&self, identity: &Identity) -> bool {
        let removed = self.paired.write().await.remove(identity).is_some();
        if removed {
            tracing::info!(identity = %identity, "Identity unpaired");
        }
        removed
    }

    /// All paired identities, oldest first.
    pub async fn paired_identities(&self) -> Vec<PairedIdentity> {
        let paired = self.paired.read().await;
        let mut list: Vec<PairedIdentity> = paired.values().cloned().collect();
        list.sort_by(|a, b| a.paired_at.cmp(&b.paired_at));
        list
    }
}
