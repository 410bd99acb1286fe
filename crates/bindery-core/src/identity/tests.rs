use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use super::config::IdentityConfig;
use super::verifier::IdentityVerifier;
use crate::error::AuthError;

const ISSUER: &str = "https://tokens.ci.example.com";
const AUDIENCE: &str = "bindery-publish";

fn test_config() -> IdentityConfig {
    IdentityConfig::default()
        .with_issuer(ISSUER)
        .with_audience(vec![AUDIENCE.to_string()])
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn valid_claims() -> serde_json::Value {
    json!({
        "sub": "repo:acme/book-pipeline:ref:refs/heads/main",
        "iss": ISSUER,
        "aud": AUDIENCE,
        "exp": now_secs() + 600,
        "iat": now_secs(),
        "repository": "acme/book-pipeline",
        "workflow": "publish.yml",
        "run_id": "8675309",
        "sha": "0add1edc0ffee",
        "actor": "octocat"
    })
}

struct TestKeys {
    private_pem: String,
    public_pem: String,
    public: rsa::RsaPublicKey,
}

fn generate_keys() -> TestKeys {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048).expect("failed to generate key");
    let public = private.to_public_key();
    TestKeys {
        private_pem: private
            .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap()
            .to_string(),
        public_pem: public
            .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
            .unwrap(),
        public,
    }
}

fn sign_rs256(keys: &TestKeys, kid: Option<&str>, claims: &serde_json::Value) -> String {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = kid.map(String::from);
    encode(
        &header,
        claims,
        &EncodingKey::from_rsa_pem(keys.private_pem.as_bytes()).unwrap(),
    )
    .unwrap()
}

#[tokio::test]
async fn valid_token_yields_worker_context() {
    let keys = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), keys.public_pem.as_bytes()).unwrap();

    let token = sign_rs256(&keys, None, &valid_claims());
    let ctx = verifier.verify(&token).await.unwrap();

    assert_eq!(ctx.repository, "acme/book-pipeline");
    assert_eq!(ctx.workflow, "publish.yml");
    assert_eq!(ctx.run_id, "8675309");
    assert_eq!(ctx.commit, "0add1edc0ffee");
    assert_eq!(ctx.actor.as_deref(), Some("octocat"));
}

#[tokio::test]
async fn symmetric_algorithm_is_rejected() {
    let keys = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), keys.public_pem.as_bytes()).unwrap();

    let token = encode(
        &Header::new(Algorithm::HS256),
        &valid_claims(),
        &EncodingKey::from_secret(b"test_secret_for_unit_testing_only"),
    )
    .unwrap();

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::SignatureInvalid { .. }));
}

#[tokio::test]
async fn dangerous_headers_are_rejected() {
    let keys = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), keys.public_pem.as_bytes()).unwrap();

    for forged in [
        r#"{"alg":"RS256","typ":"JWT","jku":"https://evil.example/keys"}"#,
        r#"{"alg":"RS256","typ":"JWT","crit":["unknown"]}"#,
    ] {
        let token = format!("{}.e30.sig", URL_SAFE_NO_PAD.encode(forged));
        let err = verifier.verify(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::Malformed { .. }), "{forged}");
    }
}

#[tokio::test]
async fn wrong_audience_is_bad_audience() {
    let keys = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), keys.public_pem.as_bytes()).unwrap();

    let mut claims = valid_claims();
    claims["aud"] = json!("some-other-service");
    let token = sign_rs256(&keys, None, &claims);

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::BadAudience { .. }));
    assert_eq!(err.code(), "BAD_AUDIENCE");
}

#[tokio::test]
async fn audience_list_membership_is_accepted() {
    let keys = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), keys.public_pem.as_bytes()).unwrap();

    let mut claims = valid_claims();
    claims["aud"] = json!(["unrelated", AUDIENCE]);
    let token = sign_rs256(&keys, None, &claims);

    assert!(verifier.verify(&token).await.is_ok());
}

#[tokio::test]
async fn wrong_issuer_is_bad_issuer() {
    let keys = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), keys.public_pem.as_bytes()).unwrap();

    let mut claims = valid_claims();
    claims["iss"] = json!("https://impostor.example");
    let token = sign_rs256(&keys, None, &claims);

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::BadIssuer { .. }));
    assert_eq!(err.code(), "BAD_ISSUER");
}

#[tokio::test]
async fn expired_token_is_rejected() {
    let keys = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), keys.public_pem.as_bytes()).unwrap();

    let mut claims = valid_claims();
    claims["exp"] = json!(now_secs() - 120); // well past the 30s leeway
    let token = sign_rs256(&keys, None, &claims);

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::Expired));
    assert_eq!(err.code(), "EXPIRED");
}

#[tokio::test]
async fn foreign_key_signature_is_rejected() {
    let trusted = generate_keys();
    let attacker = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), trusted.public_pem.as_bytes()).unwrap();

    let token = sign_rs256(&attacker, None, &valid_claims());

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::SignatureInvalid { .. }));
    assert_eq!(err.code(), "SIGNATURE_INVALID");
}

#[tokio::test]
async fn claims_missing_run_id_are_malformed() {
    let keys = generate_keys();
    let verifier =
        IdentityVerifier::with_static_key(test_config(), keys.public_pem.as_bytes()).unwrap();

    let mut claims = valid_claims();
    claims.as_object_mut().unwrap().remove("run_id");
    let token = sign_rs256(&keys, None, &claims);

    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::Malformed { .. }));
}

#[tokio::test]
async fn jwks_flow_resolves_key_by_kid() {
    let keys = generate_keys();
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "keys": [{
                "kid": "key-2026-08",
                "kty": "RSA",
                "alg": "RS256",
                "n": URL_SAFE_NO_PAD.encode(keys.public.n().to_bytes_be()),
                "e": URL_SAFE_NO_PAD.encode(keys.public.e().to_bytes_be()),
            }]
        })))
        .mount(&mock_server)
        .await;

    let mut jwks_uri: url::Url = mock_server.uri().parse().unwrap();
    jwks_uri.set_path("/jwks.json");
    let config = IdentityConfig {
        allow_private_jwks_host: true, // wiremock listens on loopback
        ..test_config()
    }
    .with_jwks_uri(jwks_uri);
    let verifier = IdentityVerifier::new(config).unwrap();

    // Token signed under the published kid verifies.
    let token = sign_rs256(&keys, Some("key-2026-08"), &valid_claims());
    assert!(verifier.verify(&token).await.is_ok());

    // A kid absent from the key set does not.
    let token = sign_rs256(&keys, Some("rotated-away"), &valid_claims());
    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::SignatureInvalid { .. }));

    // No kid at all cannot be resolved against a key set.
    let token = sign_rs256(&keys, None, &valid_claims());
    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::Malformed { .. }));
}

#[test]
fn private_key_set_hosts_are_refused_by_default() {
    use super::jwks::JwksProvider;

    let unsafe_uris = [
        "https://127.0.0.1/jwks.json",
        "https://[::1]/jwks.json",
        "https://10.0.0.5/jwks",
        "https://192.168.1.1/jwks",
        "https://172.16.0.1/jwks",
        "https://172.31.255.255/jwks",
        "https://169.254.169.254/latest/meta-data", // cloud metadata
    ];
    for u in unsafe_uris {
        let url: url::Url = u.parse().unwrap();
        assert!(
            JwksProvider::new(url, 0, false).is_err(),
            "should refuse {u}"
        );
    }

    for u in ["https://tokens.ci.example.com/jwks", "https://8.8.8.8/jwks"] {
        let url: url::Url = u.parse().unwrap();
        assert!(JwksProvider::new(url, 0, false).is_ok(), "should allow {u}");
    }
}

#[tokio::test]
async fn unreachable_key_set_surfaces_key_fetch_failed() {
    let keys = generate_keys();
    // Nothing listens here; connection is refused immediately.
    let config = IdentityConfig {
        fetch_retries: 0,
        ..test_config()
    }
    .with_jwks_uri("https://jwks.invalid./keys".parse().unwrap());
    let verifier = IdentityVerifier::new(config).unwrap();

    let token = sign_rs256(&keys, Some("any"), &valid_claims());
    let err = verifier.verify(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::KeyFetchFailed { .. }));
    assert_eq!(err.code(), "KEY_FETCH_FAILED");
    assert!(err.is_retryable());
}
