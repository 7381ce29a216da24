//! Tenant access token issuance and caching.
//!
//! Same proactive-refresh scheme as the Feishu docs client: the token is
//! refreshed `margin` before its announced expiry, and the refresh runs under
//! the write lock with a double check so concurrent callers share one issuance.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::Credentials;
use crate::error::{LarkError, Result};

/// Fallback TTL when `expire` field is absent.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7200);
/// Refresh token this many seconds before announced expiry.
pub const DEFAULT_REFRESH_MARGIN: Duration = Duration::from_secs(120);

/// A freshly issued token and the lifetime the server reported for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    pub value: String,
    pub lifetime: Duration,
}

/// Source of tenant access tokens.
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self) -> Result<IssuedToken>;
}

/// Reads the lifetime from `expire` or `expires_in`, defaulting to two hours.
pub(crate) fn extract_token_ttl(body: &serde_json::Value) -> Duration {
    let ttl = body
        .get("expire")
        .or_else(|| body.get("expires_in"))
        .and_then(|v| {
            v.as_u64()
                .or_else(|| v.as_i64().and_then(|i| u64::try_from(i).ok()))
        })
        .unwrap_or(DEFAULT_TOKEN_TTL.as_secs());
    Duration::from_secs(ttl.max(1))
}

/// Issues tokens from `POST /auth/v3/tenant_access_token/internal`.
pub struct TenantTokenIssuer {
    http: reqwest::Client,
    url: String,
    credentials: Credentials,
}

impl TenantTokenIssuer {
    pub fn new(http: reqwest::Client, api_base: &str, credentials: Credentials) -> Self {
        Self {
            http,
            url: format!("{api_base}/auth/v3/tenant_access_token/internal"),
            credentials,
        }
    }
}

#[async_trait]
impl TokenIssuer for TenantTokenIssuer {
    async fn issue(&self) -> Result<IssuedToken> {
        let body = serde_json::json!({
            "app_id": self.credentials.app_id,
            "app_secret": self.credentials.app_secret,
        });

        let resp = self.http.post(&self.url).json(&body).send().await?;
        let status = resp.status();
        let data: serde_json::Value = resp.json().await.map_err(|e| {
            LarkError::UpstreamAuthFailure(format!("undecodable response (status={status}): {e}"))
        })?;

        let code = data.get("code").and_then(|c| c.as_i64()).unwrap_or(-1);
        if code != 0 {
            let msg = data
                .get("msg")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(LarkError::UpstreamAuthFailure(msg.to_string()));
        }
        if !status.is_success() {
            return Err(LarkError::UpstreamAuthFailure(format!("status={status}")));
        }

        let value = data
            .get("tenant_access_token")
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                LarkError::UpstreamAuthFailure("missing tenant_access_token in response".into())
            })?
            .to_string();

        Ok(IssuedToken {
            value,
            lifetime: extract_token_ttl(&data),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_after: Instant,
}

fn refresh_deadline(now: Instant, lifetime: Duration, margin: Duration) -> Instant {
    let refresh_in = lifetime
        .checked_sub(margin)
        .filter(|d| !d.is_zero())
        .unwrap_or(Duration::from_secs(1));
    now + refresh_in
}

/// Process-lifetime cache holding at most one tenant token.
pub struct TokenCache {
    issuer: Arc<dyn TokenIssuer>,
    margin: Duration,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(issuer: Arc<dyn TokenIssuer>, margin: Duration) -> Self {
        Self {
            issuer,
            margin,
            cached: RwLock::new(None),
        }
    }

    /// Get or refresh tenant access token (cached with proactive refresh).
    pub async fn get_token(&self) -> Result<String> {
        // Fast path: read lock
        {
            let cached = self.cached.read().await;
            if let Some(ref t) = *cached {
                if Instant::now() < t.refresh_after {
                    return Ok(t.value.clone());
                }
            }
        }

        let mut cached = self.cached.write().await;

        // Another caller may have refreshed while we waited for the write lock
        if let Some(ref t) = *cached {
            if Instant::now() < t.refresh_after {
                return Ok(t.value.clone());
            }
        }

        let issued = self.issuer.issue().await?;
        let refresh_after = refresh_deadline(Instant::now(), issued.lifetime, self.margin);
        tracing::debug!(
            lifetime_secs = issued.lifetime.as_secs(),
            "tenant_access_token refreshed"
        );
        *cached = Some(CachedToken {
            value: issued.value.clone(),
            refresh_after,
        });
        Ok(issued.value)
    }

    /// Drop the cached token (upstream reported it expired or invalid).
    pub async fn invalidate(&self) {
        let mut cached = self.cached.write().await;
        *cached = None;
    }
}
