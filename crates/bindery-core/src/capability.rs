//! Capability token issuer/verifier.
//!
//! After a successful attestation handshake the state machine mints a second,
//! self-issued signed token that merges the authority of the original user
//! and the attested worker, scoped to one session and the single "publish"
//! capability. It is bearer-style: possession + valid signature + unexpired +
//! matching session id is sufficient authorization for status and finalize
//! calls.
//!
//! The token deliberately does not re-embed the third-party identity token;
//! it is a fresh app-issued credential so its lifetime is under our control,
//! independent of the identity issuer's (often very short) token lifetime.

use anyhow::Context;
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::AuthError;
use crate::session::WorkerContext;

/// The only scope this flow ever grants.
pub const SCOPE_PUBLISH: &str = "publish";

/// Claims carried by a capability token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityClaims {
    /// Original user id (the principal that created the session).
    pub sub: String,

    /// Session this capability is scoped to.
    pub sid: String,

    /// Always [`SCOPE_PUBLISH`]; anything else is rejected.
    pub scope: String,

    /// Attested worker binding.
    pub repository: String,
    pub run_id: String,

    pub iat: usize,
    pub exp: usize,
}

/// Mints and validates capability tokens with an Ed25519 keypair.
pub struct CapabilityAuthority {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    ttl: Duration,
    leeway_secs: u64,
}

impl CapabilityAuthority {
    /// Default token lifetime: long enough for a publish job to finish, short
    /// enough to bound the blast radius of a leaked token.
    pub const DEFAULT_TTL_HOURS: i64 = 2;

    /// Generate a fresh keypair. Suitable for single-instance deployments;
    /// tokens do not survive a restart.
    pub fn generate() -> anyhow::Result<Self> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pem = signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .context("encode generated key as PKCS#8 PEM")?;
        Self::from_pkcs8_pem(&pem)
    }

    /// Load the signing key from a PKCS#8 PEM string (e.g. a mounted secret),
    /// so multiple server instances can verify each other's tokens.
    pub fn from_pkcs8_pem(pem: &str) -> anyhow::Result<Self> {
        // Parse through dalek first so a malformed key fails here, at startup,
        // rather than on the first issue() call.
        let signing_key =
            SigningKey::from_pkcs8_pem(pem).context("parse Ed25519 PKCS#8 private key")?;
        let public_pem = signing_key
            .verifying_key()
            .to_public_key_pem(LineEnding::LF)
            .context("encode Ed25519 public key")?;

        Ok(Self {
            encoding_key: EncodingKey::from_ed_pem(pem.as_bytes())
                .context("build JWT encoding key")?,
            decoding_key: DecodingKey::from_ed_pem(public_pem.as_bytes())
                .context("build JWT decoding key")?,
            ttl: Duration::hours(Self::DEFAULT_TTL_HOURS),
            leeway_secs: 30,
        })
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sign a capability for `subject` over `session_id`, bound to the
    /// attested worker.
    pub fn issue(
        &self,
        subject: &str,
        session_id: &str,
        ctx: &WorkerContext,
    ) -> anyhow::Result<String> {
        let now = Utc::now();
        let claims = CapabilityClaims {
            sub: subject.to_string(),
            sid: session_id.to_string(),
            scope: SCOPE_PUBLISH.to_string(),
            repository: ctx.repository.clone(),
            run_id: ctx.run_id.clone(),
            iat: now.timestamp() as usize,
            exp: (now + self.ttl).timestamp() as usize,
        };

        encode(&Header::new(Algorithm::EdDSA), &claims, &self.encoding_key)
            .context("sign capability token")
    }

    /// Check signature, expiry and scope; returns the claims on success.
    pub fn verify(&self, token: &str) -> Result<CapabilityClaims, AuthError> {
        let mut validation = Validation::new(Algorithm::EdDSA);
        validation.leeway = self.leeway_secs;
        validation.set_required_spec_claims(&["exp"]);

        let data = decode::<CapabilityClaims>(token, &self.decoding_key, &validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                jsonwebtoken::errors::ErrorKind::ImmatureSignature => AuthError::Expired,
                _ => AuthError::BadSignature {
                    reason: e.to_string(),
                },
            },
        )?;

        let claims = data.claims;
        if claims.scope != SCOPE_PUBLISH {
            return Err(AuthError::WrongScope {
                scope: claims.scope,
            });
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> WorkerContext {
        WorkerContext {
            repository: "acme/book-pipeline".to_string(),
            workflow: "publish.yml".to_string(),
            run_id: "42".to_string(),
            commit: "abc123".to_string(),
            actor: None,
        }
    }

    #[test]
    fn issue_verify_roundtrip() {
        let authority = CapabilityAuthority::generate().unwrap();
        let token = authority.issue("user-1", "sess-1", &ctx()).unwrap();

        let claims = authority.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.sid, "sess-1");
        assert_eq!(claims.scope, SCOPE_PUBLISH);
        assert_eq!(claims.repository, "acme/book-pipeline");
        assert_eq!(claims.run_id, "42");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn expired_token_is_rejected_with_expired() {
        let authority = CapabilityAuthority::generate()
            .unwrap()
            .with_ttl(Duration::hours(-1));
        let token = authority.issue("user-1", "sess-1", &ctx()).unwrap();

        let err = authority.verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::Expired));
        assert_eq!(err.code(), "EXPIRED");
    }

    #[test]
    fn foreign_signature_is_rejected() {
        let ours = CapabilityAuthority::generate().unwrap();
        let theirs = CapabilityAuthority::generate().unwrap();
        let token = theirs.issue("user-1", "sess-1", &ctx()).unwrap();

        let err = ours.verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::BadSignature { .. }));
        assert_eq!(err.code(), "BAD_SIGNATURE");
    }

    #[test]
    fn wrong_scope_is_rejected() {
        let authority = CapabilityAuthority::generate().unwrap();
        // Forge a token with our own key but a different scope claim.
        let now = Utc::now();
        let claims = CapabilityClaims {
            sub: "user-1".to_string(),
            sid: "sess-1".to_string(),
            scope: "admin".to_string(),
            repository: "acme/book-pipeline".to_string(),
            run_id: "42".to_string(),
            iat: now.timestamp() as usize,
            exp: (now + Duration::hours(1)).timestamp() as usize,
        };
        let token = encode(
            &Header::new(Algorithm::EdDSA),
            &claims,
            &authority.encoding_key,
        )
        .unwrap();

        let err = authority.verify(&token).unwrap_err();
        assert!(matches!(err, AuthError::WrongScope { .. }));
        assert_eq!(err.code(), "WRONG_SCOPE");
    }

    #[test]
    fn pem_loaded_authorities_share_verification() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let pem = signing_key.to_pkcs8_pem(LineEnding::LF).unwrap();

        let issuer = CapabilityAuthority::from_pkcs8_pem(&pem).unwrap();
        let verifier = CapabilityAuthority::from_pkcs8_pem(&pem).unwrap();

        let token = issuer.issue("user-1", "sess-1", &ctx()).unwrap();
        assert!(verifier.verify(&token).is_ok());
    }
}
