//! Identity-token verification.
//!
//! The external publish worker proves who it is with a short-lived token
//! signed by a third-party identity issuer (a CI token service). This module
//! validates such tokens against the issuer's rotating published key set,
//! enforcing exact issuer match, audience membership and the expiry window,
//! and maps the claims to the worker context recorded on the session.

pub mod config;
pub mod jwks;
pub mod verifier;

pub use config::IdentityConfig;
pub use jwks::JwksProvider;
pub use verifier::IdentityVerifier;

#[cfg(test)]
mod tests;
