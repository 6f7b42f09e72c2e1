//! Resilient HTTP request utilities using retry and timeout middleware.
//!
//! Wraps each GET with [`seatbelt`] retry and timeout middleware so that transient network
//! failures and short server-side throttling are masked automatically.

use core::time::Duration;
use layered::{Execute, Service, Stack};
use ohno::app_err;
use reqwest::header::HeaderMap;
use seatbelt::retry::{Backoff, Retry};
use seatbelt::timeout::Timeout;
use seatbelt::{RecoveryInfo, ResilienceContext};
use tick::Clock;
use url::Url;

/// Timeout for one API request, including reading the headers.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum retry attempts (on top of the original request).
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Base delay for exponential backoff between retries.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);

/// Longest `Retry-After` honored inside the retry loop; longer waits go through the governor.
const MAX_INLINE_RETRY_AFTER: u64 = 60;

/// One GET request: the target and the per-request headers (authorization, accept).
#[derive(Debug, Clone)]
pub struct GetRequest {
    pub url: Url,
    pub headers: HeaderMap,
}

/// Parse the `Retry-After` header value as seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    let s = headers.get(reqwest::header::RETRY_AFTER).and_then(|h| h.to_str().ok())?;
    s.trim().parse::<u64>().ok()
}

/// Classify an HTTP response for retry purposes.
fn should_retry_response(result: &crate::Result<reqwest::Response>) -> RecoveryInfo {
    match result {
        // Network / connection errors are always transient.
        Err(_) => RecoveryInfo::retry(),

        // Server errors (5xx) are transient.
        Ok(resp) if resp.status().is_server_error() => RecoveryInfo::retry(),

        // Short Retry-After waits are absorbed here; long ones surface to the caller.
        Ok(resp) if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS || resp.status() == reqwest::StatusCode::FORBIDDEN => {
            match parse_retry_after(resp.headers()) {
                Some(delay) if delay <= MAX_INLINE_RETRY_AFTER => RecoveryInfo::retry().delay(Duration::from_secs(delay)),
                _ => RecoveryInfo::never(),
            }
        }

        // Everything else (success, 4xx client errors) is not retried.
        _ => RecoveryInfo::never(),
    }
}

/// Send an HTTP GET request with automatic retry and timeout.
///
/// Retries on network errors and 5xx responses with exponential backoff, and on 403/429
/// responses that ask for a short `Retry-After` wait.
pub async fn resilient_get(client: &reqwest::Client, request: GetRequest) -> crate::Result<reqwest::Response> {
    let clock = Clock::new_tokio();
    let context = ResilienceContext::new(&clock).name("api_get");

    let client = client.clone();
    let service = (
        Retry::layer("retry", &context)
            .clone_input()
            .recovery_with(|result: &crate::Result<reqwest::Response>, _| should_retry_response(result))
            .max_retry_attempts(MAX_RETRY_ATTEMPTS)
            .base_delay(RETRY_BASE_DELAY)
            .backoff(Backoff::Exponential)
            .on_retry(|_output, args| {
                log::debug!(
                    "retrying HTTP GET (attempt {}, delay {}ms)",
                    args.attempt().index() + 1,
                    args.retry_delay().as_millis(),
                );
            }),
        Timeout::layer("timeout", &context)
            .timeout_error(|_| app_err!("HTTP request timed out"))
            .timeout(DEFAULT_REQUEST_TIMEOUT),
        Execute::new(move |request: GetRequest| {
            let client = client.clone();
            async move {
                client
                    .get(request.url)
                    .headers(request.headers)
                    .send()
                    .await
                    .map_err(ohno::AppError::from)
            }
        }),
    )
        .into_service();

    service.execute(request).await
}
