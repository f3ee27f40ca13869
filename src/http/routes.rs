//! Pairing endpoints.
//!
//! Every response is `200 OK` with a JSON body; failures are reported in
//! the body so the website calling `/code` can show them as-is.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::pairing::{CodeIssuer, Identity, PairingService};
use crate::session::ConnectionState;

/// Placeholder returned by `/code` when no number was supplied.
pub const ENTER_NUMBER: &str = "ENTER NUMBER";
/// Placeholder returned by `/code` when issuance failed.
pub const FAILED: &str = "FAILED";

#[derive(Clone)]
pub struct AppState {
    pub issuer: Arc<CodeIssuer>,
    pub pairing: Arc<PairingService>,
    pub session: watch::Receiver<ConnectionState>,
}

#[derive(Debug, Deserialize)]
pub struct CodeQuery {
    number: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    code: Option<String>,
    number: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct CodeResponse {
    pub code: String,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct VerifyResponse {
    pub success: bool,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: String,
    pub session: ConnectionState,
}

pub fn pairing_routes(state: AppState) -> Router {
    Router::new()
        .route("/code", get(code_handler))
        .route("/verify", get(verify_handler))
        .route("/health", get(health_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn code_handler(
    State(state): State<AppState>,
    Query(query): Query<CodeQuery>,
) -> Json<CodeResponse> {
    let Some(number) = non_empty(query.number) else {
        return Json(CodeResponse {
            code: ENTER_NUMBER.to_string(),
        });
    };

    let code = match Identity::parse(&number) {
        Ok(identity) => match state.issuer.issue(&identity).await {
            Ok(code) => {
                tracing::info!(identity = %identity, "Issued pairing code over HTTP");
                code
            }
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "Pairing code issuance failed");
                FAILED.to_string()
            }
        },
        Err(e) => {
            tracing::debug!(error = %e, "Rejected /code request");
            FAILED.to_string()
        }
    };

    Json(CodeResponse { code })
}

async fn verify_handler(
    State(state): State<AppState>,
    Query(query): Query<VerifyQuery>,
) -> Json<VerifyResponse> {
    let (Some(code), Some(number)) = (non_empty(query.code), non_empty(query.number)) else {
        return Json(VerifyResponse { success: false });
    };
    let Ok(identity) = Identity::parse(&number) else {
        return Json(VerifyResponse { success: false });
    };

    let success = match state.pairing.confirm(&code, &identity).await {
        Ok(paired) => {
            tracing::info!(identity = %paired.identity, "Paired over HTTP");
            true
        }
        Err(e) => {
            tracing::debug!(identity = %identity, error = %e, "HTTP verification failed");
            false
        }
    };

    Json(VerifyResponse { success })
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        session: *state.session.borrow(),
    })
}
