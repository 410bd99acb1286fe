//! HTTP surface for the Bindery publish-session attestation protocol.
//!
//! Wires [`bindery_core`]'s state machine behind an axum router, together
//! with the two external collaborators the initiate path needs: the primary
//! user-session verifier and the credit ledger.
//!
//! # Configuration
//!
//! | Environment Variable | Description |
//! |---------------------|-------------|
//! | `BINDERY_BIND` | Listen address (default `127.0.0.1:8787`) |
//! | `BINDERY_DB` | SQLite session-store path (in-memory if unset) |
//! | `BINDERY_CAPABILITY_KEY` | PKCS#8 PEM path for the capability signing key |
//! | `BINDERY_CREDITS_URL` | Credit-ledger base URL (no-op ledger if unset) |
//! | `BINDERY_AUTH_INTROSPECT_URL` | Primary-session introspection endpoint |
//! | `BINDERY_DEV_TOKEN` / `BINDERY_DEV_USER` | Static dev credential pair |
//!
//! The identity-verifier trust settings (`BINDERY_IDENTITY_*`) are read by
//! [`bindery_core::identity::IdentityConfig::from_env`].

pub mod api;
pub mod auth;
pub mod credits;
pub mod state;

pub use api::{create_router, start_server, ServerConfig};
pub use state::AppState;
