//! Verification of third-party-issued identity tokens.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use super::config::IdentityConfig;
use super::jwks::JwksProvider;
use crate::error::AuthError;
use crate::session::WorkerContext;

/// Wire shape of the claims we consume from the identity issuer.
#[derive(Debug, Deserialize)]
struct IdentityTokenClaims {
    #[allow(dead_code)]
    sub: String,
    repository: Option<String>,
    workflow: Option<String>,
    run_id: Option<String>,
    sha: Option<String>,
    actor: Option<String>,
}

enum KeySource {
    Jwks(JwksProvider),
    Static(Arc<DecodingKey>),
}

/// Validates identity tokens against the configured issuer, audience and key
/// set, and maps their claims to a [`WorkerContext`].
pub struct IdentityVerifier {
    config: IdentityConfig,
    keys: KeySource,
}

impl IdentityVerifier {
    /// Production constructor: keys resolved through the issuer's JWKS.
    pub fn new(config: IdentityConfig) -> anyhow::Result<Self> {
        if config.issuer.is_empty() {
            anyhow::bail!("identity verifier requires a trusted issuer");
        }
        if config.audience.is_empty() {
            anyhow::bail!("identity verifier requires at least one expected audience");
        }
        let jwks_uri = config
            .jwks_uri
            .clone()
            .ok_or_else(|| anyhow::anyhow!("identity verifier requires a JWKS URI"))?;
        let provider = JwksProvider::new(
            jwks_uri,
            config.fetch_retries,
            config.allow_private_jwks_host,
        )?;
        Ok(Self {
            config,
            keys: KeySource::Jwks(provider),
        })
    }

    /// Verify against a fixed RSA public key instead of a fetched key set.
    /// No network; used by tests and single-key dev setups.
    pub fn with_static_key(config: IdentityConfig, key_pem: &[u8]) -> anyhow::Result<Self> {
        if config.issuer.is_empty() || config.audience.is_empty() {
            anyhow::bail!("identity verifier requires issuer and audience");
        }
        let key = DecodingKey::from_rsa_pem(key_pem)
            .map_err(|e| anyhow::anyhow!("failed to parse RSA public key PEM: {}", e))?;
        Ok(Self {
            config,
            keys: KeySource::Static(Arc::new(key)),
        })
    }

    /// Verify an identity token and extract the worker binding.
    pub async fn verify(&self, token: &str) -> Result<WorkerContext, AuthError> {
        // Manual header decode first: catch fields the typed Header would
        // silently drop.
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(AuthError::Malformed {
                reason: "not a compact JWT".to_string(),
            });
        }
        let header_json =
            URL_SAFE_NO_PAD
                .decode(parts[0])
                .map_err(|e| AuthError::Malformed {
                    reason: format!("header base64: {e}"),
                })?;
        let header_value: serde_json::Value =
            serde_json::from_slice(&header_json).map_err(|e| AuthError::Malformed {
                reason: format!("header JSON: {e}"),
            })?;

        if let Some(obj) = header_value.as_object() {
            if obj.contains_key("crit") {
                return Err(AuthError::Malformed {
                    reason: "token carries critical extensions we do not understand".to_string(),
                });
            }
            for dangerous in ["jku", "jwk", "x5u", "x5c"] {
                if obj.contains_key(dangerous) {
                    return Err(AuthError::Malformed {
                        reason: format!("token carries dangerous header '{dangerous}'"),
                    });
                }
            }
        }

        let header = decode_header(token).map_err(|e| AuthError::Malformed {
            reason: format!("header decode: {e}"),
        })?;

        // Reject 'none' and anything outside the whitelist.
        match header.alg {
            Algorithm::RS256 | Algorithm::ES256 => {}
            other => {
                return Err(AuthError::SignatureInvalid {
                    reason: format!("algorithm {other:?} not allowed"),
                })
            }
        }

        let key = match &self.keys {
            KeySource::Static(key) => key.clone(),
            KeySource::Jwks(provider) => {
                let kid = header.kid.as_deref().ok_or_else(|| AuthError::Malformed {
                    reason: "token has no key id".to_string(),
                })?;
                provider.get_key(kid).await?
            }
        };

        let mut validation = Validation::new(header.alg);
        validation.leeway = self.config.clock_skew_leeway.as_secs();
        validation.set_issuer(&[&self.config.issuer]);
        validation.set_audience(&self.config.audience);
        validation.set_required_spec_claims(&["exp", "iss", "aud"]);

        let data = decode::<IdentityTokenClaims>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature | ErrorKind::ImmatureSignature => AuthError::Expired,
                ErrorKind::InvalidIssuer => AuthError::BadIssuer {
                    expected: self.config.issuer.clone(),
                },
                ErrorKind::InvalidAudience => AuthError::BadAudience {
                    expected: self.config.audience.clone(),
                },
                ErrorKind::InvalidSignature => AuthError::SignatureInvalid {
                    reason: "signature mismatch".to_string(),
                },
                _ => AuthError::SignatureInvalid {
                    reason: e.to_string(),
                },
            }
        })?;

        Self::context_from_claims(data.claims)
    }

    fn context_from_claims(claims: IdentityTokenClaims) -> Result<WorkerContext, AuthError> {
        let missing = |field: &str| AuthError::Malformed {
            reason: format!("identity token missing '{field}' claim"),
        };
        Ok(WorkerContext {
            repository: claims.repository.ok_or_else(|| missing("repository"))?,
            workflow: claims.workflow.ok_or_else(|| missing("workflow"))?,
            run_id: claims.run_id.ok_or_else(|| missing("run_id"))?,
            commit: claims.sha.ok_or_else(|| missing("sha"))?,
            actor: claims.actor,
        })
    }
}
