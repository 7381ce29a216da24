//! Authenticated HTTP access to the Lark Open Platform.
//!
//! Every call presents a bearer tenant token, retries transient failures with
//! exponential backoff, and treats a non-zero `code` in the JSON body as a
//! failure regardless of the HTTP status.

use std::sync::Arc;
use std::time::Duration;

use crate::config::LarkConfig;
use crate::error::{LarkError, Result};
use crate::lark::token::{TenantTokenIssuer, TokenCache};

/// Feishu/Lark API business code for expired/invalid tenant access token.
pub const LARK_INVALID_ACCESS_TOKEN_CODE: i64 = 99_991_663;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_cap: Duration,
    pub retry_after_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(10),
            retry_after_cap: Duration::from_secs(30),
        }
    }
}

/// Binary body returned by a download endpoint.
#[derive(Debug, Clone)]
pub struct Download {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

pub(crate) fn extract_response_code(body: &serde_json::Value) -> Option<i64> {
    body.get("code").and_then(|c| c.as_i64())
}

fn should_refresh_token(status: reqwest::StatusCode, body: &serde_json::Value) -> bool {
    status == reqwest::StatusCode::UNAUTHORIZED
        || extract_response_code(body) == Some(LARK_INVALID_ACCESS_TOKEN_CODE)
}

/// Non-zero `code` wins over the HTTP status; a missing `code` on a non-2xx is an HTTP failure.
pub(crate) fn ensure_api_success(
    status: reqwest::StatusCode,
    body: &serde_json::Value,
    context: &str,
) -> Result<()> {
    let code = extract_response_code(body);
    if let Some(code) = code.filter(|c| *c != 0) {
        let msg = body
            .get("msg")
            .and_then(|m| m.as_str())
            .unwrap_or("unknown error");
        return Err(LarkError::api(context, code, msg));
    }
    if !status.is_success() {
        return Err(LarkError::UpstreamHttp {
            context: context.to_string(),
            status,
        });
    }
    if code.is_none() {
        return Err(LarkError::unexpected(context, format!("missing code in body: {body}")));
    }
    Ok(())
}

#[derive(Clone)]
pub struct LarkClient {
    http: reqwest::Client,
    api_base: String,
    tokens: Arc<TokenCache>,
    retry: RetryPolicy,
}

impl LarkClient {
    pub fn new(http: reqwest::Client, api_base: impl Into<String>, tokens: Arc<TokenCache>) -> Self {
        Self {
            http,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            tokens,
            retry: RetryPolicy::default(),
        }
    }

    /// Build the HTTP client, token issuer and cache from config.
    pub fn from_config(config: &LarkConfig) -> Result<Self> {
        let credentials = config.credentials()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.request_timeout_secs.min(10)))
            .build()?;
        let api_base = config.api_base();
        let issuer = TenantTokenIssuer::new(http.clone(), &api_base, credentials);
        let tokens = Arc::new(TokenCache::new(
            Arc::new(issuer),
            Duration::from_secs(config.token_refresh_margin_secs),
        ));
        Ok(Self::new(http, api_base, tokens))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    pub fn tokens(&self) -> &Arc<TokenCache> {
        &self.tokens
    }

    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}{path}", self.api_base)
    }

    /// Send an HTTP request with retry and exponential backoff.
    /// Retries on 429 (with Retry-After parsing), 5xx, and network errors.
    /// Non-retryable 4xx (except 429) are returned immediately.
    async fn send_with_retry<F>(&self, build_request: F) -> Result<reqwest::Response>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut backoff = self.retry.base_backoff;

        for attempt in 0..=self.retry.max_attempts {
            let resp = match build_request().send().await {
                Ok(resp) => resp,
                Err(e) => {
                    if attempt == self.retry.max_attempts {
                        return Err(e.into());
                    }
                    tracing::warn!(attempt, "Lark request failed (network): {e}, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(self.retry.backoff_cap);
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success()
                || (status.is_client_error() && status.as_u16() != 429)
                || attempt == self.retry.max_attempts
            {
                return Ok(resp);
            }

            let wait = if status.as_u16() == 429 {
                resp.headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<f64>().ok())
                    .map(|secs| {
                        Duration::from_secs_f64(secs.max(0.0)).min(self.retry.retry_after_cap)
                    })
                    .unwrap_or(backoff)
            } else {
                backoff
            };

            tracing::warn!(
                attempt,
                status = %status,
                wait_ms = wait.as_millis() as u64,
                "Lark request failed, retrying"
            );
            tokio::time::sleep(wait).await;
            backoff = (backoff * 2).min(self.retry.backoff_cap);
        }

        Err(LarkError::unexpected("request", "retry loop exhausted"))
    }

    async fn send_once_json<F>(&self, token: &str, build: &F) -> Result<(reqwest::StatusCode, serde_json::Value)>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let resp = self
            .send_with_retry(|| build(&self.http, token).bearer_auth(token))
            .await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;
        let body = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        Ok((status, body))
    }

    /// Authenticated JSON call. Refreshes the token once on 401 / invalid-token code.
    pub async fn call_json<F>(&self, context: &str, build: F) -> Result<serde_json::Value>
    where
        F: Fn(&reqwest::Client, &str) -> reqwest::RequestBuilder,
    {
        let token = self.tokens.get_token().await?;
        let (mut status, mut body) = self.send_once_json(&token, &build).await?;

        if should_refresh_token(status, &body) {
            tracing::info!("Lark {context}: tenant token rejected, refreshing");
            self.tokens.invalidate().await;
            let token = self.tokens.get_token().await?;
            (status, body) = self.send_once_json(&token, &build).await?;
        }

        ensure_api_success(status, &body, context)?;
        Ok(body)
    }

    pub async fn get_json(
        &self,
        context: &str,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        self.call_json(context, |http, _| http.get(&url).query(query))
            .await
    }

    pub async fn post_json(
        &self,
        context: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        self.call_json(context, |http, _| http.post(&url).json(body))
            .await
    }

    pub async fn put_json(
        &self,
        context: &str,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        self.call_json(context, |http, _| http.put(&url).json(body))
            .await
    }

    /// POST a pre-encoded body with an explicit content type.
    pub async fn post_raw(
        &self,
        context: &str,
        path: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<serde_json::Value> {
        let url = self.url(path);
        self.call_json(context, |http, _| {
            http.post(&url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(body.to_vec())
        })
        .await
    }

    /// GET a binary resource. A non-2xx status is a failure.
    pub async fn get_bytes(&self, context: &str, path: &str) -> Result<Download> {
        let url = self.url(path);
        let token = self.tokens.get_token().await?;
        let resp = self
            .send_with_retry(|| self.http.get(&url).bearer_auth(&token))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(LarkError::UpstreamHttp {
                context: context.to_string(),
                status,
            });
        }
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = resp.bytes().await?.to_vec();
        Ok(Download {
            bytes,
            content_type,
        })
    }
}
