//! GitHub API client
//!
//! Thin client that authenticates each request with the next token in rotation, sends it
//! through [`resilient_get`], and classifies the outcome.

use super::rate_limit::{RateWindow, header_value};
use super::resilient_http::{GetRequest, parse_retry_after, resilient_get};
use crate::Result;
use core::sync::atomic::{AtomicUsize, Ordering};
use core::time::Duration;
use ohno::IntoAppError;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, HeaderValue};
use std::sync::Arc;
use url::Url;

const LOG_TARGET: &str = "    client";

pub const DEFAULT_BASE_URL: &str = "https://api.github.com";
pub const DEFAULT_ACCEPT: &str = "application/vnd.github+json";

/// Result of one API call
#[derive(Debug)]
pub enum ApiResult<T> {
    /// Request succeeded - contains data and optional quota info
    Success(T, Option<RateWindow>),

    /// The quota is exhausted - retry once the window resets
    RateLimited { window: Option<RateWindow>, retry_after: Option<Duration> },

    /// Any other non-success status; the caller decides whether it is fatal
    Rejected(T, Option<RateWindow>),

    /// The request could not be completed
    Failed(ohno::AppError),
}

/// What the `/rate_limit` endpoint reported.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuotaReport {
    /// Advertised `X-RateLimit-Limit` for one token.
    pub limit: Option<u32>,
    pub window: Option<RateWindow>,
}

/// GitHub REST API client
#[derive(Debug, Clone)]
#[expect(clippy::struct_field_names, reason = "client field stores the underlying HTTP client")]
pub struct ApiClient {
    client: reqwest::Client,
    base_url: Url,
    tokens: Arc<[HeaderValue]>,
    next_token: Arc<AtomicUsize>,
}

impl ApiClient {
    /// Create a client for `base_url`, rotating across `tokens` (which may be empty).
    pub fn new(tokens: &[String], base_url: &str) -> Result<Self> {
        let mut base_url = Url::parse(base_url).into_app_err_with(|| format!("parsing API base URL '{base_url}'"))?;
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let tokens = tokens
            .iter()
            .map(|token| token.trim())
            .filter(|token| !token.is_empty())
            .map(|token| {
                let mut value = HeaderValue::from_str(&format!("Bearer {token}")).into_app_err("invalid characters in API token")?;
                value.set_sensitive(true);
                Ok(value)
            })
            .collect::<Result<Vec<_>>>()?;

        let client = reqwest::Client::builder()
            .user_agent(concat!("ghsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .into_app_err("building HTTP client")?;

        Ok(Self {
            client,
            base_url,
            tokens: tokens.into(),
            next_token: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Get the base URL for this client (always ends with `/`)
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Number of tokens in rotation.
    #[must_use]
    pub fn token_count(&self) -> usize {
        self.tokens.len()
    }

    /// Resolve a path relative to the base URL.
    pub fn endpoint_url(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .into_app_err_with(|| format!("building request URL for '{path}'"))
    }

    fn request_headers(&self, accept: Option<&str>) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let accept = HeaderValue::from_str(accept.unwrap_or(DEFAULT_ACCEPT)).into_app_err("invalid accept header")?;
        let _ = headers.insert(ACCEPT, accept);

        if !self.tokens.is_empty() {
            let index = self.next_token.fetch_add(1, Ordering::Relaxed) % self.tokens.len();
            let _ = headers.insert(AUTHORIZATION, self.tokens[index].clone());
        }

        Ok(headers)
    }

    /// Make an API call and classify the result
    pub async fn api_call(&self, url: &Url, accept: Option<&str>) -> ApiResult<reqwest::Response> {
        let headers = match self.request_headers(accept) {
            Ok(h) => h,
            Err(e) => return ApiResult::Failed(e),
        };

        let resp = match resilient_get(&self.client, GetRequest { url: url.clone(), headers }).await {
            Ok(r) => r,
            Err(e) => return ApiResult::Failed(e),
        };

        // Extract quota info from response headers before checking status
        let window = RateWindow::from_headers(resp.headers());

        let status = resp.status();
        if status.is_success() {
            return ApiResult::Success(resp, window);
        }

        if is_quota_exhausted(status, resp.headers()) {
            let retry_after = parse_retry_after(resp.headers()).map(Duration::from_secs);
            return ApiResult::RateLimited { window, retry_after };
        }

        ApiResult::Rejected(resp, window)
    }

    /// Read the quota headers of the `rate_limit` endpoint.
    ///
    /// Failures are logged and yield an empty report; callers fall back to configured defaults.
    pub async fn query_quota(&self) -> QuotaReport {
        let url = match self.endpoint_url("rate_limit") {
            Ok(url) => url,
            Err(e) => {
                log::warn!(target: LOG_TARGET, "Could not build rate limit URL: {e:#}");
                return QuotaReport::default();
            }
        };

        match self.api_call(&url, None).await {
            ApiResult::Success(resp, window) | ApiResult::Rejected(resp, window) => QuotaReport {
                limit: header_value(resp.headers(), "x-ratelimit-limit"),
                window,
            },
            ApiResult::RateLimited { window, .. } => QuotaReport {
                limit: window.and_then(|w| w.ceiling),
                window,
            },
            ApiResult::Failed(e) => {
                log::warn!(target: LOG_TARGET, "Could not read rate limits at '{url}': {e:#}");
                QuotaReport::default()
            }
        }
    }
}

/// 429, or 403 when the quota is spent or the server asks us to back off.
fn is_quota_exhausted(status: StatusCode, headers: &HeaderMap) -> bool {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return true;
    }

    status == StatusCode::FORBIDDEN
        && (header_value::<u32>(headers, "x-ratelimit-remaining") == Some(0) || parse_retry_after(headers).is_some())
}
