//! State-machine scenario tests over an in-memory store and a static
//! identity key (no network).

use std::sync::Arc;

use chrono::Duration;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey};
use rsa::RsaPrivateKey;
use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::capability::CapabilityAuthority;
use crate::error::{AuthError, CreditError, PublishError, SessionError};
use crate::identity::{IdentityConfig, IdentityVerifier};
use crate::session::ledger::{CreditLedger, NoopLedger};
use crate::session::service::{FinalizeOutcome, InitiateRequest, PublishService};
use crate::session::SessionStatus;
use crate::store::{ProgressPatch, SessionStore, TtlPolicy};

const ISSUER: &str = "https://tokens.ci.example.com";
const AUDIENCE: &str = "bindery-publish";

struct Harness {
    service: Arc<PublishService>,
    private_pem: String,
}

fn harness_with(ttl: TtlPolicy, ledger: Arc<dyn CreditLedger>) -> Harness {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, 2048).expect("failed to generate key");
    let private_pem = private
        .to_pkcs8_pem(rsa::pkcs8::LineEnding::LF)
        .unwrap()
        .to_string();
    let public_pem = private
        .to_public_key()
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .unwrap();

    let config = IdentityConfig::default()
        .with_issuer(ISSUER)
        .with_audience(vec![AUDIENCE.to_string()]);
    let identity = IdentityVerifier::with_static_key(config, public_pem.as_bytes()).unwrap();

    let store = Arc::new(SessionStore::in_memory(ttl).unwrap());
    let capability = CapabilityAuthority::generate().unwrap();

    Harness {
        service: Arc::new(PublishService::new(store, identity, capability, ledger)),
        private_pem,
    }
}

fn harness() -> Harness {
    harness_with(TtlPolicy::default(), Arc::new(NoopLedger))
}

impl Harness {
    fn identity_token(&self) -> String {
        self.identity_token_with(|_| {})
    }

    fn identity_token_with(&self, tweak: impl FnOnce(&mut serde_json::Value)) -> String {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let mut claims = json!({
            "sub": "repo:acme/book-pipeline:ref:refs/heads/main",
            "iss": ISSUER,
            "aud": AUDIENCE,
            "exp": now + 600,
            "iat": now,
            "repository": "acme/book-pipeline",
            "workflow": "publish.yml",
            "run_id": "8675309",
            "sha": "0add1edc0ffee",
            "actor": "octocat"
        });
        tweak(&mut claims);
        encode(
            &Header::new(Algorithm::RS256),
            &claims,
            &EncodingKey::from_rsa_pem(self.private_pem.as_bytes()).unwrap(),
        )
        .unwrap()
    }
}

fn initiate_request() -> InitiateRequest {
    InitiateRequest {
        content_ref: "book-7@rev-12".to_string(),
        format: "epub".to_string(),
        metadata: None,
    }
}

#[tokio::test]
async fn happy_path_initiate_attest_update_finalize() {
    let h = harness();

    let receipt = h.service.initiate("user-1", &initiate_request()).await.unwrap();
    assert!(!receipt.nonce.is_empty());

    let attest = h
        .service
        .attest(&h.identity_token(), &receipt.session_id, &receipt.nonce)
        .await
        .unwrap();
    assert_eq!(attest.status, SessionStatus::RunnerAttested);
    assert!(!attest.capability_token.is_empty());

    let update = h
        .service
        .update_status(
            &attest.capability_token,
            &receipt.session_id,
            ProgressPatch {
                phase: Some("render".to_string()),
                message: None,
                progress: Some(10),
            },
        )
        .unwrap();
    assert_eq!(update.status, SessionStatus::Processing);

    let done = h
        .service
        .finalize(
            &attest.capability_token,
            &receipt.session_id,
            FinalizeOutcome::Completed,
            Some(json!({"url": "https://cdn.example/book-7.epub"})),
            None,
        )
        .unwrap();
    assert!(done.success);
    assert_eq!(done.status, SessionStatus::Completed);

    let session = h.service.read_status(&receipt.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.result.is_some());
    assert!(session.error.is_none());
    // Secrets never leave through the public read.
    assert!(session.nonce.is_none());
    assert!(session.capability_token.is_none());
    let ctx = session.worker_context.unwrap();
    assert_eq!(ctx.repository, "acme/book-pipeline");
}

#[tokio::test]
async fn attest_with_wrong_audience_leaves_session_pending() {
    let h = harness();
    let receipt = h.service.initiate("user-1", &initiate_request()).await.unwrap();

    let token = h.identity_token_with(|c| c["aud"] = json!("someone-else"));
    let err = h
        .service
        .attest(&token, &receipt.session_id, &receipt.nonce)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Auth(AuthError::BadAudience { .. })
    ));
    assert_eq!(err.code(), "BAD_AUDIENCE");

    let session = h.service.read_status(&receipt.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::PendingRunner);
}

#[tokio::test]
async fn attest_with_wrong_nonce_leaves_session_pending() {
    let h = harness();
    let receipt = h.service.initiate("user-1", &initiate_request()).await.unwrap();

    let err = h
        .service
        .attest(&h.identity_token(), &receipt.session_id, "deadbeef")
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_SESSION");

    // A correct worker can still attest afterwards.
    let attest = h
        .service
        .attest(&h.identity_token(), &receipt.session_id, &receipt.nonce)
        .await
        .unwrap();
    assert_eq!(attest.status, SessionStatus::RunnerAttested);
}

#[tokio::test]
async fn concurrent_attests_bind_exactly_one_worker() {
    let h = harness();
    let receipt = h.service.initiate("user-1", &initiate_request()).await.unwrap();

    let token_a = h.identity_token();
    let token_b = h.identity_token();
    let (service_a, service_b) = (h.service.clone(), h.service.clone());
    let (id_a, nonce_a) = (receipt.session_id.clone(), receipt.nonce.clone());
    let (id_b, nonce_b) = (receipt.session_id.clone(), receipt.nonce.clone());

    let (a, b) = tokio::join!(
        tokio::spawn(async move { service_a.attest(&token_a, &id_a, &nonce_a).await }),
        tokio::spawn(async move { service_b.attest(&token_b, &id_b, &nonce_b).await }),
    );
    let results = [a.unwrap(), b.unwrap()];

    let wins = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(wins, 1, "exactly one attest must win");
    let loser = results.iter().find(|r| r.is_err()).unwrap();
    assert_eq!(loser.as_ref().unwrap_err().code(), "INVALID_SESSION");
}

#[tokio::test]
async fn capability_is_bound_to_its_session() {
    let h = harness();

    let first = h.service.initiate("user-1", &initiate_request()).await.unwrap();
    let second = h.service.initiate("user-1", &initiate_request()).await.unwrap();

    let attest = h
        .service
        .attest(&h.identity_token(), &first.session_id, &first.nonce)
        .await
        .unwrap();

    // The first session's capability cannot drive the second session.
    let err = h
        .service
        .update_status(
            &attest.capability_token,
            &second.session_id,
            ProgressPatch::default(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        PublishError::Auth(AuthError::SessionMismatch { .. })
    ));
}

#[tokio::test]
async fn garbage_capability_is_rejected_without_touching_the_session() {
    let h = harness();
    let receipt = h.service.initiate("user-1", &initiate_request()).await.unwrap();
    h.service
        .attest(&h.identity_token(), &receipt.session_id, &receipt.nonce)
        .await
        .unwrap();

    let err = h
        .service
        .update_status("not.a.token", &receipt.session_id, ProgressPatch::default())
        .unwrap_err();
    assert_eq!(err.code(), "BAD_SIGNATURE");

    let session = h.service.read_status(&receipt.session_id).unwrap();
    assert_eq!(session.status, SessionStatus::RunnerAttested);
}

#[tokio::test]
async fn finalize_requires_matching_payload_shape() {
    let h = harness();
    let receipt = h.service.initiate("user-1", &initiate_request()).await.unwrap();
    let attest = h
        .service
        .attest(&h.identity_token(), &receipt.session_id, &receipt.nonce)
        .await
        .unwrap();

    // completed without a result
    let err = h
        .service
        .finalize(
            &attest.capability_token,
            &receipt.session_id,
            FinalizeOutcome::Completed,
            None,
            None,
        )
        .unwrap_err();
    assert!(matches!(err, PublishError::Validation(_)));

    // failed with a result instead of an error
    let err = h
        .service
        .finalize(
            &attest.capability_token,
            &receipt.session_id,
            FinalizeOutcome::Failed,
            Some(json!({"url": "nope"})),
            None,
        )
        .unwrap_err();
    assert!(matches!(err, PublishError::Validation(_)));
}

#[tokio::test]
async fn repeat_finalize_is_a_no_op_success() {
    let h = harness();
    let receipt = h.service.initiate("user-1", &initiate_request()).await.unwrap();
    let attest = h
        .service
        .attest(&h.identity_token(), &receipt.session_id, &receipt.nonce)
        .await
        .unwrap();

    let error_payload = json!({"code": "RENDER_FAILED", "message": "missing chapter 3"});
    let first = h
        .service
        .finalize(
            &attest.capability_token,
            &receipt.session_id,
            FinalizeOutcome::Failed,
            None,
            Some(error_payload.clone()),
        )
        .unwrap();
    assert_eq!(first.status, SessionStatus::Failed);

    // At-least-once delivery: the retry succeeds and changes nothing.
    let second = h
        .service
        .finalize(
            &attest.capability_token,
            &receipt.session_id,
            FinalizeOutcome::Failed,
            None,
            Some(error_payload.clone()),
        )
        .unwrap();
    assert!(second.success);
    assert_eq!(second.status, SessionStatus::Failed);

    // A flipped outcome does not rewrite history.
    let flipped = h
        .service
        .finalize(
            &attest.capability_token,
            &receipt.session_id,
            FinalizeOutcome::Completed,
            Some(json!({"url": "https://cdn.example/late.epub"})),
            None,
        )
        .unwrap();
    assert_eq!(flipped.status, SessionStatus::Failed);

    let session = h.service.read_status(&receipt.session_id).unwrap();
    assert_eq!(session.error, Some(error_payload));
    assert!(session.result.is_none());
}

#[tokio::test]
async fn credit_rejection_fails_before_any_session_exists() {
    struct BrokeLedger;

    #[async_trait::async_trait]
    impl CreditLedger for BrokeLedger {
        async fn spend(&self, _: &str, _: &str, _: &str) -> Result<(), CreditError> {
            Err(CreditError::Rejected {
                reason: "insufficient balance".to_string(),
            })
        }
    }

    let h = harness_with(TtlPolicy::default(), Arc::new(BrokeLedger));
    let err = h.service.initiate("user-1", &initiate_request()).await.unwrap_err();
    assert_eq!(err.code(), "INSUFFICIENT_CREDITS");
}

#[tokio::test]
async fn expired_session_reads_as_expired_not_missing() {
    let ttl = TtlPolicy::default().with_active(Duration::milliseconds(20));
    let h = harness_with(ttl, Arc::new(NoopLedger));
    let receipt = h.service.initiate("user-1", &initiate_request()).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(40)).await;

    let err = h.service.read_status(&receipt.session_id).unwrap_err();
    assert!(matches!(
        err,
        PublishError::Session(SessionError::Expired { .. })
    ));
    assert_eq!(err.code(), "SESSION_EXPIRED");

    let err = h.service.read_status("never-existed").unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}
