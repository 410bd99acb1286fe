//! HTTP handlers for the publish-session endpoints.

use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use bindery_core::error::{PublishError, SessionError};
use bindery_core::session::{FinalizeOutcome, InitiateRequest};
use bindery_core::store::ProgressPatch;

use crate::auth::PrimaryAuthError;
use crate::state::AppState;

/// Error response structure. `code` is the stable machine contract.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    /// Present only for the `410 Gone` classification of aged-out sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expired_at: Option<DateTime<Utc>>,
    /// Debug detail, emitted only when the server runs with dev errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            expired_at: None,
            detail: None,
        }
    }

    fn from_publish(err: &PublishError, dev_errors: bool) -> Self {
        let expired_at = match err {
            PublishError::Session(SessionError::Expired { expired_at, .. }) => Some(*expired_at),
            _ => None,
        };
        Self {
            error: err.to_string(),
            code: err.code().to_string(),
            expired_at,
            detail: dev_errors.then(|| format!("{err:?}")),
        }
    }

    fn from_primary_auth(err: &PrimaryAuthError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.code.as_str() {
            "MISSING_FIELDS" | "MALFORMED_REQUEST" => StatusCode::BAD_REQUEST,
            "UNAUTHORIZED" | "MALFORMED_TOKEN" | "EXPIRED" | "BAD_ISSUER" | "BAD_AUDIENCE"
            | "SIGNATURE_INVALID" | "BAD_SIGNATURE" | "WRONG_SCOPE" | "SESSION_MISMATCH" => {
                StatusCode::UNAUTHORIZED
            }
            "INSUFFICIENT_CREDITS" => StatusCode::PAYMENT_REQUIRED,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "INVALID_SESSION" => StatusCode::CONFLICT,
            "SESSION_EXPIRED" => StatusCode::GONE,
            "KEY_FETCH_FAILED" | "STORE_UNAVAILABLE" | "CREDIT_SERVICE_UNAVAILABLE"
            | "AUTH_SERVICE_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

/// `Authorization: Bearer <token>`, or `None`.
fn bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn require_bearer(headers: &HeaderMap) -> Result<&str, ErrorResponse> {
    bearer(headers).ok_or_else(|| ErrorResponse::new("UNAUTHORIZED", "missing bearer credential"))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub timestamp: String,
}

pub async fn health_handler() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        timestamp: Utc::now().to_rfc3339(),
    })
}

pub async fn ready_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    // Any answer other than a storage failure proves the store is reachable.
    match state.service.read_status("readiness-probe") {
        Err(PublishError::Session(SessionError::Storage { .. })) => {
            (StatusCode::SERVICE_UNAVAILABLE, "not ready")
        }
        _ => (StatusCode::OK, "ready"),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateBody {
    #[serde(default)]
    pub content_ref: Option<String>,
    #[serde(default)]
    pub format: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// `POST /api/v1/publish`: authenticated with the primary user session.
///
/// The returned nonce is for the server-side dispatch payload; it must not be
/// handed to browser-visible state.
pub async fn initiate_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<InitiateBody>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let token = require_bearer(&headers)?;
    let user_id = state
        .auth
        .verify_user(token)
        .await
        .map_err(|e| ErrorResponse::from_primary_auth(&e))?;

    let request = InitiateRequest {
        content_ref: body.content_ref.unwrap_or_default(),
        format: body.format.unwrap_or_default(),
        metadata: body.metadata,
    };
    let receipt = state
        .service
        .initiate(&user_id, &request)
        .await
        .map_err(|e| ErrorResponse::from_publish(&e, state.dev_errors))?;

    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestBody {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
}

/// `POST /api/v1/publish/attest`: the worker's attestation handshake.
/// Requires the identity token as bearer credential; never accepts anything
/// else.
pub async fn attest_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<AttestBody>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let identity_token = require_bearer(&headers)?;

    let mut missing = Vec::new();
    if body.session_id.as_deref().unwrap_or("").is_empty() {
        missing.push("sessionId");
    }
    if body.nonce.as_deref().unwrap_or("").is_empty() {
        missing.push("nonce");
    }
    if !missing.is_empty() {
        return Err(ErrorResponse::new(
            "MISSING_FIELDS",
            format!("missing fields: {missing:?}"),
        ));
    }

    let receipt = state
        .service
        .attest(
            identity_token,
            body.session_id.as_deref().unwrap_or(""),
            body.nonce.as_deref().unwrap_or(""),
        )
        .await
        .map_err(|e| ErrorResponse::from_publish(&e, state.dev_errors))?;

    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBody {
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub progress: Option<u32>,
}

/// `POST /api/v1/publish/{id}/events`: idempotent progress report, gated on
/// the capability token.
pub async fn update_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<EventBody>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let capability = require_bearer(&headers)?;
    let receipt = state
        .service
        .update_status(
            capability,
            &id,
            ProgressPatch {
                phase: body.phase,
                message: body.message,
                progress: body.progress,
            },
        )
        .map_err(|e| ErrorResponse::from_publish(&e, state.dev_errors))?;

    Ok(Json(receipt))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeBody {
    #[serde(default)]
    pub outcome: Option<FinalizeOutcome>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

/// `POST /api/v1/publish/{id}/finalize`: terminal outcome, accepted once;
/// retries get the stored record back as a success.
pub async fn finalize_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<FinalizeBody>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let capability = require_bearer(&headers)?;
    let outcome = body.outcome.ok_or_else(|| {
        ErrorResponse::new("MISSING_FIELDS", "missing fields: [\"outcome\"]")
    })?;

    let receipt = state
        .service
        .finalize(capability, &id, outcome, body.result, body.error)
        .map_err(|e| ErrorResponse::from_publish(&e, state.dev_errors))?;

    Ok(Json(receipt))
}

/// `GET /api/v1/publish/{id}`: the polling surface. No credential required
/// beyond knowledge of the session id; secrets are stripped from the
/// projection.
pub async fn read_status_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ErrorResponse> {
    let session = state
        .service
        .read_status(&id)
        .map_err(|e| ErrorResponse::from_publish(&e, state.dev_errors))?;
    Ok(Json(session))
}
