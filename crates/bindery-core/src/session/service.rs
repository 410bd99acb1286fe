//! Publish session state machine.
//!
//! Orchestrates the full session lifecycle over the store, the identity
//! verifier, the capability authority and the credit ledger:
//!
//! ```text
//! pending-runner ──(attest)──► runner-attested ──(first update)──► processing
//!                                                                      │
//!                                              (finalize) ─────────────┤
//!                                                                      ▼
//!                                                  completed | failed | aborted
//! ```
//!
//! Attestation is the only step requiring two distinct pieces of trust: a
//! valid third-party identity token AND the pre-shared single-use nonce. An
//! attacker holding just the nonce cannot produce an identity token for the
//! real job; a legitimately-identified but wrong job never received the
//! nonce.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::capability::CapabilityAuthority;
use crate::error::{AuthError, PublishError, PublishResult, ValidationError};
use crate::identity::IdentityVerifier;
use crate::session::ledger::{idempotency_key, CreditLedger, ACTION_PUBLISH};
use crate::session::model::{PublishSession, SessionStatus};
use crate::store::{ProgressPatch, SessionStore};

/// Initiate request body. `content_ref` names the book revision to render;
/// the fields travel onward in the dispatch payload, which is outside this
/// component's scope.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub content_ref: String,
    pub format: String,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Returned to the session owner. The nonce belongs in the server-side
/// dispatch payload, never in browser-visible state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateReceipt {
    pub session_id: String,
    pub nonce: String,
}

/// Returned to the worker on successful attestation.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttestReceipt {
    pub capability_token: String,
    pub session_id: String,
    pub status: SessionStatus,
}

/// Returned for status updates and finalize calls.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateReceipt {
    pub success: bool,
    pub session_id: String,
    pub status: SessionStatus,
}

/// Terminal outcome reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinalizeOutcome {
    Completed,
    Failed,
    Aborted,
}

impl FinalizeOutcome {
    pub fn status(self) -> SessionStatus {
        match self {
            Self::Completed => SessionStatus::Completed,
            Self::Failed => SessionStatus::Failed,
            Self::Aborted => SessionStatus::Aborted,
        }
    }
}

/// The orchestration layer: every mutation of a publish session goes through
/// here.
pub struct PublishService {
    store: Arc<SessionStore>,
    identity: IdentityVerifier,
    capability: CapabilityAuthority,
    ledger: Arc<dyn CreditLedger>,
}

impl PublishService {
    pub fn new(
        store: Arc<SessionStore>,
        identity: IdentityVerifier,
        capability: CapabilityAuthority,
        ledger: Arc<dyn CreditLedger>,
    ) -> Self {
        Self {
            store,
            identity,
            capability,
            ledger,
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Create a session for `user_id`, spending credits first.
    ///
    /// The caller is responsible for dispatching the external job with
    /// `(session_id, nonce)`. If that dispatch fails, the orphan session
    /// simply ages out via the active TTL; creation and dispatch are not
    /// atomic.
    pub async fn initiate(
        &self,
        user_id: &str,
        request: &InitiateRequest,
    ) -> PublishResult<InitiateReceipt> {
        let mut missing = Vec::new();
        if request.content_ref.trim().is_empty() {
            missing.push("contentRef");
        }
        if request.format.trim().is_empty() {
            missing.push("format");
        }
        if !missing.is_empty() {
            return Err(ValidationError::MissingFields { fields: missing }.into());
        }

        let key = idempotency_key(user_id, ACTION_PUBLISH, Utc::now());
        self.ledger.spend(user_id, ACTION_PUBLISH, &key).await?;

        let session = self.store.create(user_id)?;
        tracing::info!(
            session_id = %session.id,
            user_id = %user_id,
            format = %request.format,
            "publish initiated"
        );
        Ok(InitiateReceipt {
            nonce: session.nonce.clone().unwrap_or_default(),
            session_id: session.id,
        })
    }

    /// The attestation handshake.
    ///
    /// Verifies the identity token, then atomically consumes the nonce while
    /// recording the worker context and the freshly issued capability token.
    /// If either step fails, no session mutation occurs. Of N racing calls,
    /// at most one succeeds; the rest observe `INVALID_SESSION`.
    pub async fn attest(
        &self,
        identity_token: &str,
        session_id: &str,
        nonce: &str,
    ) -> PublishResult<AttestReceipt> {
        if identity_token.is_empty() || session_id.is_empty() || nonce.is_empty() {
            return Err(ValidationError::MissingFields {
                fields: vec!["identityToken", "sessionId", "nonce"],
            }
            .into());
        }

        let ctx = self.identity.verify(identity_token).await.map_err(|e| {
            tracing::warn!(session_id = %session_id, code = e.code(), "identity verification failed");
            e
        })?;

        // The subject of the capability is the session owner, read before the
        // consume; the conditional write below remains the single authority on
        // whether this attestation wins.
        let session = self.store.get(session_id)?;
        let token = self
            .capability
            .issue(&session.user_id, session_id, &ctx)
            .map_err(|e| PublishError::Internal {
                message: format!("capability issuance failed: {e:#}"),
            })?;

        let attested = self.store.consume_nonce(session_id, nonce, &ctx, &token)?;
        tracing::info!(
            session_id = %session_id,
            repository = %ctx.repository,
            run_id = %ctx.run_id,
            "worker attested"
        );

        Ok(AttestReceipt {
            capability_token: token,
            session_id: attested.id,
            status: attested.status,
        })
    }

    /// Merge a progress report from the worker. Idempotent: re-applying the
    /// same fields leaves the same stored state.
    pub fn update_status(
        &self,
        capability_token: &str,
        session_id: &str,
        patch: ProgressPatch,
    ) -> PublishResult<UpdateReceipt> {
        self.authorize(capability_token, session_id)?;
        let session = self.store.update_progress(session_id, &patch)?;
        Ok(UpdateReceipt {
            success: true,
            session_id: session.id,
            status: session.status,
        })
    }

    /// Report the terminal outcome. Accepted once; a repeat finalize on an
    /// already-terminal session returns the existing record as a success so
    /// at-least-once workers can retry safely. A differing outcome never
    /// overwrites the stored one.
    pub fn finalize(
        &self,
        capability_token: &str,
        session_id: &str,
        outcome: FinalizeOutcome,
        result: Option<serde_json::Value>,
        error: Option<serde_json::Value>,
    ) -> PublishResult<UpdateReceipt> {
        self.authorize(capability_token, session_id)?;

        match (outcome, &result, &error) {
            (FinalizeOutcome::Completed, Some(_), None) => {}
            (FinalizeOutcome::Completed, _, _) => {
                return Err(ValidationError::Malformed {
                    message: "completed outcome requires 'result' and no 'error'".to_string(),
                }
                .into())
            }
            (_, None, Some(_)) => {}
            (_, _, _) => {
                return Err(ValidationError::Malformed {
                    message: "failure outcomes require 'error' and no 'result'".to_string(),
                }
                .into())
            }
        }

        let (session, _newly) =
            self.store
                .finalize(session_id, outcome.status(), result.as_ref(), error.as_ref())?;
        Ok(UpdateReceipt {
            success: true,
            session_id: session.id,
            status: session.status,
        })
    }

    /// Public status read: the record minus its secrets, or a distinct
    /// expired classification once past the retention TTL.
    pub fn read_status(&self, session_id: &str) -> PublishResult<PublishSession> {
        Ok(self.store.get(session_id)?.redacted())
    }

    /// Capability-token gate for status/finalize calls. Never falls back to
    /// any other credential type.
    fn authorize(&self, capability_token: &str, session_id: &str) -> PublishResult<()> {
        if capability_token.is_empty() {
            return Err(ValidationError::MissingFields {
                fields: vec!["capabilityToken"],
            }
            .into());
        }
        let claims = self.capability.verify(capability_token).map_err(|e| {
            tracing::warn!(session_id = %session_id, code = e.code(), "capability rejected");
            e
        })?;
        if claims.sid != session_id {
            return Err(AuthError::SessionMismatch { bound: claims.sid }.into());
        }
        Ok(())
    }
}
