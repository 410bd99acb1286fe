//! Primary-session verification for the initiate endpoint.
//!
//! The browser's primary authentication session is an external collaborator;
//! this module only defines the verification seam. Attest, events and
//! finalize never fall back to it: those endpoints always require their own
//! credential type.

use async_trait::async_trait;
use serde::Deserialize;

/// Primary-session verification failures.
#[derive(Debug, thiserror::Error)]
pub enum PrimaryAuthError {
    /// The presented credential does not belong to an active user session.
    #[error("unauthorized: {message}")]
    Unauthorized { message: String },

    /// The auth service could not be reached.
    #[error("auth service unavailable: {message}")]
    Unavailable { message: String },
}

impl PrimaryAuthError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized { .. } => "UNAUTHORIZED",
            Self::Unavailable { .. } => "AUTH_SERVICE_UNAVAILABLE",
        }
    }
}

/// Verifies the browser session credential and yields the user id.
#[async_trait]
pub trait PrimaryAuth: Send + Sync {
    async fn verify_user(&self, bearer: &str) -> Result<String, PrimaryAuthError>;
}

/// Single pre-shared token, for dev servers and tests.
pub struct StaticTokenAuth {
    token: String,
    user_id: String,
}

impl StaticTokenAuth {
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl PrimaryAuth for StaticTokenAuth {
    async fn verify_user(&self, bearer: &str) -> Result<String, PrimaryAuthError> {
        if bearer == self.token {
            Ok(self.user_id.clone())
        } else {
            Err(PrimaryAuthError::Unauthorized {
                message: "unknown session token".to_string(),
            })
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IntrospectionResponse {
    active: bool,
    #[serde(default)]
    user_id: Option<String>,
}

/// Asks the product's auth service whether the session token is active.
pub struct IntrospectionAuth {
    client: reqwest::Client,
    introspect_url: String,
}

impl IntrospectionAuth {
    pub fn new(introspect_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .user_agent(concat!("bindery-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            introspect_url: introspect_url.into(),
        })
    }
}

#[async_trait]
impl PrimaryAuth for IntrospectionAuth {
    async fn verify_user(&self, bearer: &str) -> Result<String, PrimaryAuthError> {
        let response = self
            .client
            .post(&self.introspect_url)
            .json(&serde_json::json!({ "token": bearer }))
            .send()
            .await
            .map_err(|e| PrimaryAuthError::Unavailable {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(PrimaryAuthError::Unauthorized {
                message: format!("introspection returned HTTP {}", response.status()),
            });
        }

        let body: IntrospectionResponse =
            response
                .json()
                .await
                .map_err(|e| PrimaryAuthError::Unavailable {
                    message: format!("bad introspection response: {e}"),
                })?;

        match (body.active, body.user_id) {
            (true, Some(user_id)) => Ok(user_id),
            _ => Err(PrimaryAuthError::Unauthorized {
                message: "session inactive".to_string(),
            }),
        }
    }
}
