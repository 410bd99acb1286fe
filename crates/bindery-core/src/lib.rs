//! Publish-session attestation protocol for Bindery.
//!
//! A user-authenticated browser session hands a long-running, privileged
//! "publish" job to an external, initially-untrusted CI worker. This crate
//! implements the mechanism that makes that handoff safe:
//!
//! - [`identity`]: verifies the worker's third-party-signed identity token
//!   against the issuer's rotating key set (issuer/audience/expiry).
//! - [`store`]: durable, TTL-aware session store with the atomic
//!   consume-if-matches primitive that binds exactly one worker per session.
//! - [`capability`]: mints and validates the short-lived delegated token
//!   that merges the user's and the attested worker's authority, scoped to
//!   one session and the single "publish" capability.
//! - [`session`]: the state machine orchestrating initiate, attestation,
//!   idempotent status updates, one-shot finalization and public reads.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use bindery_core::capability::CapabilityAuthority;
//! use bindery_core::identity::{IdentityConfig, IdentityVerifier};
//! use bindery_core::session::{NoopLedger, PublishService};
//! use bindery_core::store::{SessionStore, TtlPolicy};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let store = Arc::new(SessionStore::open("sessions.db".as_ref(), TtlPolicy::default())?);
//! let identity = IdentityVerifier::new(IdentityConfig::from_env())?;
//! let capability = CapabilityAuthority::generate()?;
//! let service = PublishService::new(store, identity, capability, Arc::new(NoopLedger));
//!
//! let receipt = service
//!     .initiate("user-1", &serde_json::from_str(r#"{"contentRef":"book-7@12","format":"epub"}"#)?)
//!     .await?;
//! println!("dispatch with session {} and its nonce", receipt.session_id);
//! # Ok(())
//! # }
//! ```
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `BINDERY_IDENTITY_ISSUER` | Trusted identity-token issuer (exact match) |
//! | `BINDERY_IDENTITY_AUDIENCE` | Comma-separated accepted audiences |
//! | `BINDERY_IDENTITY_JWKS_URI` | Issuer key-set URL (https) |
//! | `BINDERY_IDENTITY_ALLOW_PRIVATE_JWKS` | Permit loopback key-set hosts (dev only) |

pub mod capability;
pub mod error;
pub mod identity;
pub mod session;
pub mod store;

pub use capability::{CapabilityAuthority, CapabilityClaims, SCOPE_PUBLISH};
pub use error::{
    AuthError, CreditError, PublishError, PublishResult, SessionError, ValidationError,
};
pub use identity::{IdentityConfig, IdentityVerifier, JwksProvider};
pub use session::{
    AttestReceipt, CreditLedger, FinalizeOutcome, InitiateReceipt, InitiateRequest, NoopLedger,
    PublishService, PublishSession, SessionStatus, UpdateReceipt, WorkerContext,
};
pub use store::{ProgressPatch, SessionStore, TtlPolicy};
