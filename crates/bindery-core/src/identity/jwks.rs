//! Fetches and caches the identity issuer's published key set.

use anyhow::Result;
use jsonwebtoken::DecodingKey;
use moka::sync::Cache;
use reqwest::Client;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use crate::error::AuthError;

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    #[allow(dead_code)]
    kty: String,
    n: Option<String>,
    e: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

/// Key provider with an in-memory cache keyed by key id, so verification does
/// not refetch the key set per request.
#[derive(Clone)]
pub struct JwksProvider {
    cache: Cache<String, Arc<DecodingKey>>,
    client: Client,
    jwks_uri: Url,
    fetch_retries: u32,
}

impl JwksProvider {
    pub fn new(jwks_uri: Url, fetch_retries: u32, allow_private_host: bool) -> Result<Self> {
        if !allow_private_host {
            Self::validate_uri(&jwks_uri)?;
        }

        Ok(Self {
            // Cap max keys to prevent memory exhaustion from a hostile key set.
            cache: Cache::builder()
                .max_capacity(100)
                .time_to_live(Duration::from_secs(3600))
                .build(),
            // Key fetches carry no request-derived headers and never follow
            // redirects.
            client: Client::builder()
                .timeout(Duration::from_secs(5))
                .user_agent(concat!("bindery-server/", env!("CARGO_PKG_VERSION")))
                .redirect(reqwest::redirect::Policy::none())
                .build()?,
            jwks_uri,
            fetch_retries,
        })
    }

    fn validate_uri(uri: &Url) -> Result<()> {
        if let Some(host) = uri.host() {
            match host {
                url::Host::Ipv4(addr) => {
                    if Self::is_unsafe_ip(&std::net::IpAddr::V4(addr)) {
                        anyhow::bail!("unsafe IP address in JWKS URI: {}", addr);
                    }
                }
                url::Host::Ipv6(addr) => {
                    if Self::is_unsafe_ip(&std::net::IpAddr::V6(addr)) {
                        anyhow::bail!("unsafe IP address in JWKS URI: {}", addr);
                    }
                }
                url::Host::Domain(_) => {}
            }
        }
        Ok(())
    }

    fn is_unsafe_ip(ip: &std::net::IpAddr) -> bool {
        match ip {
            std::net::IpAddr::V4(addr) => {
                let octets = addr.octets();
                addr.is_loopback() || addr.is_link_local() || addr.is_multicast() || addr.is_unspecified() ||
                // Private ranges (manual check for stable rust)
                (octets[0] == 10) ||
                (octets[0] == 192 && octets[1] == 168) ||
                (octets[0] == 172 && octets[1] >= 16 && octets[1] <= 31)
            }
            std::net::IpAddr::V6(addr) => {
                addr.is_loopback()
                    || addr.is_multicast()
                    || addr.is_unspecified()
                    || ((addr.segments()[0] & 0xfe00) == 0xfc00) // Unique Local (fc00::/7)
            }
        }
    }

    /// Resolve a key id, refreshing the key set on a cache miss.
    pub async fn get_key(&self, kid: &str) -> Result<Arc<DecodingKey>, AuthError> {
        if let Some(key) = self.cache.get(kid) {
            return Ok(key);
        }

        self.refresh_with_retry().await?;

        self.cache.get(kid).ok_or_else(|| AuthError::SignatureInvalid {
            reason: format!("no published key for kid {kid}"),
        })
    }

    /// Bounded exponential-backoff retry around the key-set fetch; only after
    /// exhausting the attempts does the failure surface as `KEY_FETCH_FAILED`.
    async fn refresh_with_retry(&self) -> Result<(), AuthError> {
        let mut retries = 0;
        loop {
            match self.refresh().await {
                Ok(()) => return Ok(()),
                Err(e) if retries < self.fetch_retries => {
                    retries += 1;
                    let backoff =
                        Duration::from_secs(1 << retries).min(Duration::from_secs(30));
                    tracing::warn!(
                        error = %e,
                        retry = retries,
                        backoff_secs = backoff.as_secs(),
                        "JWKS fetch failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(AuthError::KeyFetchFailed {
                        message: e.to_string(),
                    })
                }
            }
        }
    }

    async fn refresh(&self) -> Result<()> {
        tracing::info!(event = "jwks_refresh", uri = %self.jwks_uri);
        let resp = self.client.get(self.jwks_uri.clone()).send().await?;

        if let Some(len) = resp.content_length() {
            if len > 512 * 1024 {
                anyhow::bail!("JWKS response too large: {} bytes", len);
            }
        }

        let jwks: JwksResponse = resp.json().await?;

        for key in jwks.keys {
            if let (Some(n), Some(e)) = (&key.n, &key.e) {
                // RSA components only; the issuer signs with RS256.
                if let Ok(decoding_key) = DecodingKey::from_rsa_components(n, e) {
                    self.cache.insert(key.kid.clone(), Arc::new(decoding_key));
                }
            }
        }

        Ok(())
    }
}
