//! Credit-ledger collaborator.
//!
//! Triggering a publish job costs credits. The ledger itself (balances,
//! accounting) lives in another service; this module only defines the
//! side-effecting spend call consulted at initiate time, keyed by a
//! caller-supplied idempotency key so retries never double-charge.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::error::CreditError;

/// Spend action recorded for a publish trigger.
pub const ACTION_PUBLISH: &str = "publish";

/// External credit-ledger collaborator.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    /// Deduct credits for `action` at most once per `idempotency_key`.
    ///
    /// A rejection fails the initiate call before any session is created.
    async fn spend(
        &self,
        user_id: &str,
        action: &str,
        idempotency_key: &str,
    ) -> Result<(), CreditError>;
}

/// Ledger that approves every spend. For dev servers and tests.
pub struct NoopLedger;

#[async_trait]
impl CreditLedger for NoopLedger {
    async fn spend(&self, _: &str, _: &str, _: &str) -> Result<(), CreditError> {
        Ok(())
    }
}

/// Derive the idempotency key for a spend from `(user, action, timestamp)`.
pub fn idempotency_key(user_id: &str, action: &str, at: DateTime<Utc>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(user_id.as_bytes());
    hasher.update([0x1f]);
    hasher.update(action.as_bytes());
    hasher.update([0x1f]);
    hasher.update(at.to_rfc3339().as_bytes());
    hex::encode(hasher.finalize())
}
