//! Session record and status model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a publish session.
///
/// Transitions are monotonic along the ordering
/// `PendingRunner < RunnerAttested < Processing < terminal`. "Expired" is a
/// read-time classification computed against the TTL policy and is never
/// stored (see [`crate::store::SessionStore::get`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    PendingRunner,
    RunnerAttested,
    Processing,
    Completed,
    Failed,
    Aborted,
}

impl SessionStatus {
    /// Wire/storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingRunner => "pending-runner",
            Self::RunnerAttested => "runner-attested",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    /// Parse the storage representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending-runner" => Some(Self::PendingRunner),
            "runner-attested" => Some(Self::RunnerAttested),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }

    /// Position in the forward ordering. All terminal states share a rank:
    /// once terminal, no further transition is permitted.
    pub fn rank(&self) -> u8 {
        match self {
            Self::PendingRunner => 0,
            Self::RunnerAttested => 1,
            Self::Processing => 2,
            Self::Completed | Self::Failed | Self::Aborted => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Whether a write moving `self` to `next` respects monotonicity.
    pub fn can_advance_to(&self, next: Self) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity claims of the attested external worker, recorded on the session
/// after a successful attestation handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerContext {
    /// Source repository identifier (e.g. `acme/book-pipeline`).
    pub repository: String,

    /// Workflow identifier within the repository.
    pub workflow: String,

    /// Run identifier of the specific job invocation.
    pub run_id: String,

    /// Commit reference the job ran against.
    pub commit: String,

    /// Actor that triggered the job, when the issuer reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
}

/// One publish session. Owned by the session store; mutated only through the
/// state machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishSession {
    /// Opaque unique identifier, immutable.
    pub id: String,

    /// Principal that created the session, immutable.
    pub user_id: String,

    pub status: SessionStatus,

    /// Single-use attestation secret. `Some` if and only if `status` is
    /// [`SessionStatus::PendingRunner`]; cleared exactly once on consumption.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,

    /// Present if and only if `status` is at least `runner-attested`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_context: Option<WorkerContext>,

    /// Capability token issued at attestation, kept for idempotent
    /// re-delivery. Verification never consults this copy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_token: Option<String>,

    /// Job-progress fields, last-writer-wins, not ordered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Terminal payloads, mutually exclusive, set exactly once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Set only on entering a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PublishSession {
    /// Public projection for the status API: the nonce and the capability
    /// token never leave the trust boundary.
    pub fn redacted(mut self) -> Self {
        self.nonce = None;
        self.capability_token = None;
        self
    }
}
