//! Trust configuration for the identity-token verifier.

use std::env;
use std::time::Duration;
use url::Url;

/// Which issuer and audience we accept identity tokens from.
#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Trusted token issuer; exact match.
    pub issuer: String,

    /// Expected audience values; the token's `aud` must match one of them.
    pub audience: Vec<String>,

    /// Where the issuer publishes its rotating key set.
    pub jwks_uri: Option<Url>,

    /// Clock-skew tolerance applied to `exp`/`nbf`.
    pub clock_skew_leeway: Duration,

    /// Bounded retry attempts for key-set fetches before surfacing
    /// `KEY_FETCH_FAILED`.
    pub fetch_retries: u32,

    /// Permit loopback/private key-set hosts. Dev and test only; the
    /// production default refuses them (SSRF hardening).
    pub allow_private_jwks_host: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            issuer: String::new(),
            audience: Vec::new(),
            jwks_uri: None,
            clock_skew_leeway: Duration::from_secs(30),
            fetch_retries: 3,
            allow_private_jwks_host: false,
        }
    }
}

impl IdentityConfig {
    /// Build from environment variables.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `BINDERY_IDENTITY_ISSUER` | Trusted issuer (exact match) |
    /// | `BINDERY_IDENTITY_AUDIENCE` | Comma-separated accepted audiences |
    /// | `BINDERY_IDENTITY_JWKS_URI` | Issuer key-set URL (https) |
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("BINDERY_IDENTITY_ISSUER") {
            cfg.issuer = v;
        }
        if let Ok(v) = env::var("BINDERY_IDENTITY_AUDIENCE") {
            cfg.audience = v.split(',').map(|s| s.trim().to_string()).collect();
        }
        if let Ok(v) = env::var("BINDERY_IDENTITY_JWKS_URI") {
            match Url::parse(&v) {
                Ok(u) if u.scheme() == "https" => cfg.jwks_uri = Some(u),
                Ok(u) => {
                    tracing::warn!(uri = %u, "ignoring non-https JWKS URI");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring unparseable JWKS URI");
                }
            }
        }
        if let Ok(v) = env::var("BINDERY_IDENTITY_ALLOW_PRIVATE_JWKS") {
            // Dev only.
            cfg.allow_private_jwks_host = v == "1" || v.eq_ignore_ascii_case("true");
        }

        cfg
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    pub fn with_audience(mut self, audience: Vec<String>) -> Self {
        self.audience = audience;
        self
    }

    pub fn with_jwks_uri(mut self, uri: Url) -> Self {
        self.jwks_uri = Some(uri);
        self
    }
}
