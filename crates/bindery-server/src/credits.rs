//! HTTP client for the credit-ledger collaborator.

use async_trait::async_trait;
use bindery_core::error::CreditError;
use bindery_core::session::CreditLedger;

/// Spends credits against the product's ledger service.
///
/// The ledger deduplicates on the idempotency key, so a retried initiate
/// (same key) charges at most once. Accounting itself is the ledger's
/// business; we only surface accept/reject/unavailable.
pub struct HttpCreditLedger {
    client: reqwest::Client,
    spend_url: String,
}

impl HttpCreditLedger {
    pub fn new(base_url: impl Into<String>) -> anyhow::Result<Self> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent(concat!("bindery-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            spend_url: format!("{}/spend", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl CreditLedger for HttpCreditLedger {
    async fn spend(
        &self,
        user_id: &str,
        action: &str,
        idempotency_key: &str,
    ) -> Result<(), CreditError> {
        let response = self
            .client
            .post(&self.spend_url)
            .header("Idempotency-Key", idempotency_key)
            .json(&serde_json::json!({
                "userId": user_id,
                "action": action,
            }))
            .send()
            .await
            .map_err(|e| CreditError::Unavailable {
                message: e.to_string(),
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::PAYMENT_REQUIRED
            || status == reqwest::StatusCode::FORBIDDEN
        {
            Err(CreditError::Rejected {
                reason: if body.is_empty() {
                    format!("ledger returned HTTP {status}")
                } else {
                    body
                },
            })
        } else {
            Err(CreditError::Unavailable {
                message: format!("ledger returned HTTP {status}"),
            })
        }
    }
}
