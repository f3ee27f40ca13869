//! Code issuance, either local or relayed to an upstream website.
//!
//! When the bot is fronted by a website that owns code generation, the
//! `/code` endpoint and the `code` command relay to `GET {base}/code`. A
//! relayed code is recorded in the local store so `.pair` and `/verify`
//! accept it. When the upstream is down, answers without a code, answers
//! with something that is not a 6-digit code, or hands out a code that is
//! already live here, a locally issued code is used instead.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::PairingError;
use crate::pairing::identity::Identity;
use crate::pairing::service::PairingService;
use crate::pairing::store::is_well_formed_code;

#[derive(Debug, Deserialize)]
struct UpstreamCodeResponse {
    #[serde(default)]
    code: Option<String>,
}

/// HTTP client for an upstream pairing-code service.
#[derive(Debug, Clone)]
pub struct UpstreamCodeClient {
    client: reqwest::Client,
    base_url: Url,
}

impl UpstreamCodeClient {
    /// Build a client whose every request is bounded by `timeout`.
    pub fn new(base_url: Url, timeout: Duration) -> Result<Self, PairingError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| PairingError::UpstreamUnavailable {
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { client, base_url })
    }

    fn code_url(&self, identity: &Identity) -> Result<Url, PairingError> {
        let mut url = self
            .base_url
            .join("code")
            .map_err(|e| PairingError::UpstreamUnavailable {
                reason: format!("invalid upstream URL: {e}"),
            })?;
        url.query_pairs_mut()
            .append_pair("number", identity.as_str());
        Ok(url)
    }

    /// Fetch a code for `identity`.
    ///
    /// `Ok(None)` means the upstream answered but had no code to give. A
    /// value that is not a 6-digit code (the upstream's own `"Failed"`
    /// sentinel, for one) is an error.
    pub async fn fetch_code(&self, identity: &Identity) -> Result<Option<String>, PairingError> {
        let url = self.code_url(identity)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| upstream_error(&e))?
            .error_for_status()
            .map_err(|e| upstream_error(&e))?;

        let body: UpstreamCodeResponse =
            response.json().await.map_err(|e| upstream_error(&e))?;

        let Some(code) = body
            .code
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
        else {
            return Ok(None);
        };

        if !is_well_formed_code(&code) {
            tracing::warn!(code = %code, "Upstream returned a malformed pairing code");
            return Err(PairingError::UpstreamUnavailable {
                reason: format!("malformed code {code:?}"),
            });
        }
        Ok(Some(code))
    }
}

fn upstream_error(e: &reqwest::Error) -> PairingError {
    let reason = if e.is_timeout() {
        "request timed out".to_string()
    } else {
        e.to_string()
    };
    tracing::warn!(error = %reason, "Upstream code request failed");
    PairingError::UpstreamUnavailable { reason }
}

/// Where pairing codes come from.
pub enum CodeIssuer {
    /// Codes are issued and verified by this process.
    Local(Arc<PairingService>),
    /// Codes come from an upstream service, with local fallback.
    Relay {
        upstream: UpstreamCodeClient,
        fallback: Arc<PairingService>,
    },
}

impl CodeIssuer {
    /// Issue a code for `identity`. Every code returned is verifiable by
    /// this process.
    pub async fn issue(&self, identity: &Identity) -> Result<String, PairingError> {
        match self {
            CodeIssuer::Local(pairing) => pairing.request_code(identity).await,
            CodeIssuer::Relay { upstream, fallback } => {
                match upstream.fetch_code(identity).await {
                    Ok(Some(code)) => match fallback.register_code(&code, identity).await {
                        Ok(code) => {
                            tracing::info!(identity = %identity, "Relayed upstream pairing code");
                            return Ok(code);
                        }
                        Err(e) => {
                            tracing::warn!(
                                identity = %identity,
                                error = %e,
                                "Upstream code not usable, issuing locally"
                            );
                        }
                    },
                    Ok(None) => {
                        tracing::debug!(
                            identity = %identity,
                            "Upstream returned no code, issuing locally"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            identity = %identity,
                            error = %e,
                            "Upstream unavailable, issuing locally"
                        );
                    }
                }
                fallback.request_code(identity).await
            }
        }
    }
}
