//! Error types for the publish-session attestation protocol.
//!
//! Every variant carries a stable machine-readable code (see [`code`] methods)
//! so callers can decide whether to retry (e.g. a transient key-fetch failure)
//! or abort (e.g. a bad audience, which is a configuration error).

/// Token verification failures, for both the third-party identity token and
/// the self-issued capability token.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Token could not be decoded at all (not a JWT, bad base64, bad JSON).
    #[error("malformed token: {reason}")]
    Malformed { reason: String },

    /// Expiry/not-before window excludes the current time.
    #[error("token expired or not yet valid")]
    Expired,

    /// Issuer claim does not exactly match the trusted issuer.
    #[error("issuer mismatch: expected {expected}")]
    BadIssuer { expected: String },

    /// Audience claim does not match (or contain) the expected audience.
    #[error("audience mismatch: expected one of {expected:?}")]
    BadAudience { expected: Vec<String> },

    /// Identity-token signature did not verify against the issuer key set.
    #[error("signature verification failed: {reason}")]
    SignatureInvalid { reason: String },

    /// Could not obtain the issuer's public key set.
    #[error("key fetch failed: {message}")]
    KeyFetchFailed { message: String },

    /// Capability-token signature did not verify against our own key.
    #[error("capability signature invalid: {reason}")]
    BadSignature { reason: String },

    /// Capability token carries a scope other than "publish".
    #[error("wrong scope: {scope}")]
    WrongScope { scope: String },

    /// Capability token is valid but bound to a different session than the
    /// one addressed by the request.
    #[error("token bound to session {bound}")]
    SessionMismatch { bound: String },
}

impl AuthError {
    /// Stable machine code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Malformed { .. } => "MALFORMED_TOKEN",
            Self::Expired => "EXPIRED",
            Self::BadIssuer { .. } => "BAD_ISSUER",
            Self::BadAudience { .. } => "BAD_AUDIENCE",
            Self::SignatureInvalid { .. } => "SIGNATURE_INVALID",
            Self::KeyFetchFailed { .. } => "KEY_FETCH_FAILED",
            Self::BadSignature { .. } => "BAD_SIGNATURE",
            Self::WrongScope { .. } => "WRONG_SCOPE",
            Self::SessionMismatch { .. } => "SESSION_MISMATCH",
        }
    }

    /// Whether the caller may retry the same request unchanged.
    ///
    /// Only key-set fetch failures are transient; everything else is a
    /// property of the token itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::KeyFetchFailed { .. })
    }
}

/// Session-store and session-state failures.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No record for this session id (it may never have existed).
    #[error("session not found: {id}")]
    NotFound { id: String },

    /// The record aged out of its TTL window. Distinct from [`Self::NotFound`]
    /// so a client polling a just-expired session sees "expired", not
    /// "never existed".
    #[error("session expired at {expired_at}")]
    Expired {
        id: String,
        expired_at: chrono::DateTime<chrono::Utc>,
    },

    /// Nonce mismatch or the session is not in a state that permits the
    /// requested transition.
    #[error("invalid session: {reason}")]
    InvalidSession { reason: String },

    /// Store backend failure (connectivity, I/O). The one category eligible
    /// for bounded automatic retry at the HTTP layer.
    #[error("store unavailable: {message}")]
    Storage { message: String },
}

impl SessionError {
    /// Stable machine code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Expired { .. } => "SESSION_EXPIRED",
            Self::InvalidSession { .. } => "INVALID_SESSION",
            Self::Storage { .. } => "STORE_UNAVAILABLE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

impl From<rusqlite::Error> for SessionError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage {
            message: err.to_string(),
        }
    }
}

/// Malformed request bodies.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// Required fields absent from the request body.
    #[error("missing fields: {fields:?}")]
    MissingFields { fields: Vec<&'static str> },

    /// Body present but not interpretable.
    #[error("malformed request: {message}")]
    Malformed { message: String },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingFields { .. } => "MISSING_FIELDS",
            Self::Malformed { .. } => "MALFORMED_REQUEST",
        }
    }
}

/// Failures from the credit-ledger collaborator consulted at initiate time.
#[derive(Debug, thiserror::Error)]
pub enum CreditError {
    /// The ledger refused the spend (insufficient balance, plan limits).
    #[error("credit spend rejected: {reason}")]
    Rejected { reason: String },

    /// The ledger could not be reached; the initiate call fails before any
    /// session is created.
    #[error("credit service unavailable: {message}")]
    Unavailable { message: String },
}

impl CreditError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Rejected { .. } => "INSUFFICIENT_CREDITS",
            Self::Unavailable { .. } => "CREDIT_SERVICE_UNAVAILABLE",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

/// Unified error surfaced by the publish state machine.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Credit(#[from] CreditError),

    /// Unexpected internal failure (key material, serialization). Never
    /// carries stack detail to the caller.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl PublishError {
    /// Stable machine code for API responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth(e) => e.code(),
            Self::Session(e) => e.code(),
            Self::Validation(e) => e.code(),
            Self::Credit(e) => e.code(),
            Self::Internal { .. } => "INTERNAL",
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Auth(e) => e.is_retryable(),
            Self::Session(e) => e.is_retryable(),
            Self::Validation(_) => false,
            Self::Credit(e) => e.is_retryable(),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type for protocol operations.
pub type PublishResult<T> = Result<T, PublishError>;
