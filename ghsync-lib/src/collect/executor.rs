use super::client::{ApiClient, ApiResult};
use super::governor::Governor;
use super::rate_limit::{PendingCalculator, RateLimitCalculator, RateWindow, StaticCeiling};
use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use core::time::Duration;
use ohno::{EnrichableExt, IntoAppError, app_err};
use reqwest::StatusCode;
use reqwest::header::HeaderMap;
use std::sync::Arc;
use url::Url;

const LOG_TARGET: &str = "  executor";

/// Pause used when the server signals exhaustion without saying for how long.
const DEFAULT_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(60);

/// Shortest pause, so an already-reset window cannot cause a tight retry loop.
const MIN_RATE_LIMIT_PAUSE: Duration = Duration::from_secs(1);

/// Longest error body echoed into an error message.
const MAX_ERROR_BODY: usize = 256;

/// What to do with a response once its status is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseAction {
    /// Use the response; non-success statuses become errors.
    Proceed,

    /// Treat the response as "zero results" for this request.
    Skip,
}

/// Endpoint-specific hook run on every response status.
pub type AfterResponse = fn(StatusCode) -> ResponseAction;

/// Skips 404 responses.
#[must_use]
pub fn skip_not_found(status: StatusCode) -> ResponseAction {
    if status == StatusCode::NOT_FOUND {
        ResponseAction::Skip
    } else {
        ResponseAction::Proceed
    }
}

/// Skips responses about commits that do not exist or repositories that hold no commits.
#[must_use]
pub fn skip_missing_commit(status: StatusCode) -> ResponseAction {
    match status {
        StatusCode::NOT_FOUND | StatusCode::CONFLICT => ResponseAction::Skip,
        _ => ResponseAction::Proceed,
    }
}

/// Rate governance knobs for one executor.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitSettings {
    pub concurrency: usize,
    pub rate_limit_per_hour: Option<u32>,
    pub default_rate_limit_per_hour: u32,
    pub max_rate_limit_wait: Duration,
}

/// A successfully fetched page.
#[derive(Debug)]
pub struct ApiPage {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Outcome of one fetch.
#[derive(Debug)]
pub enum Fetched {
    Page(ApiPage),

    /// The after-response hook skipped this status.
    Skipped(StatusCode),
}

/// Executes API requests under a run-owned [`Governor`], feeding every response's quota
/// headers back into the [`RateLimitCalculator`].
#[derive(Debug)]
pub struct RequestExecutor {
    client: ApiClient,
    governor: Arc<Governor>,
    calculator: RateLimitCalculator,
    max_rate_limit_wait: Duration,
}

impl RequestExecutor {
    /// Query the server for its quota, then build the governor and bind the calculator to it.
    pub async fn connect(client: ApiClient, settings: &RateLimitSettings) -> Self {
        let quota = client.query_quota().await;
        let ceiling = StaticCeiling::resolve(
            settings.rate_limit_per_hour,
            quota.limit,
            client.token_count(),
            settings.default_rate_limit_per_hour,
        );

        let pending = PendingCalculator::new(ceiling, quota.window);
        log::debug!(
            target: LOG_TARGET,
            "Static ceiling of {} requests per hour, starting at one request every {:?}",
            ceiling.requests,
            pending.initial_interval()
        );

        let governor = Governor::new(settings.concurrency, pending.initial_interval());
        let calculator = pending.bind(Arc::clone(&governor));

        Self {
            client,
            governor,
            calculator,
            max_rate_limit_wait: settings.max_rate_limit_wait,
        }
    }

    #[must_use]
    pub const fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }

    #[must_use]
    pub const fn client(&self) -> &ApiClient {
        &self.client
    }

    /// Fetch one page, waiting out exhausted quotas and retrying the same request.
    pub async fn fetch(&self, url: &Url, accept: Option<&str>, after_response: AfterResponse) -> Result<Fetched> {
        loop {
            let _permit = self.governor.admit().await;

            match self.client.api_call(url, accept).await {
                ApiResult::Success(resp, window) => {
                    let _ = self.calculator.observe(window.as_ref());

                    let status = resp.status();
                    if after_response(status) == ResponseAction::Skip {
                        return Ok(Fetched::Skipped(status));
                    }

                    let headers = resp.headers().clone();
                    let body = resp
                        .bytes()
                        .await
                        .into_app_err_with(|| format!("reading response body from '{url}'"))?;

                    return Ok(Fetched::Page(ApiPage {
                        url: url.clone(),
                        status,
                        headers,
                        body,
                    }));
                }

                ApiResult::RateLimited { window, retry_after } => {
                    let wait = rate_limit_pause(window.as_ref(), retry_after, Utc::now(), self.max_rate_limit_wait);
                    if self.governor.pause_for(wait) {
                        log::warn!(
                            target: LOG_TARGET,
                            "Hit GitHub rate limit on '{url}', pausing requests for {}s",
                            wait.as_secs()
                        );
                    }
                }

                ApiResult::Rejected(resp, window) => {
                    let _ = self.calculator.observe(window.as_ref());

                    let status = resp.status();
                    if after_response(status) == ResponseAction::Skip {
                        log::debug!(target: LOG_TARGET, "Ignoring {status} from '{url}'");
                        return Ok(Fetched::Skipped(status));
                    }

                    let body = resp.text().await.unwrap_or_default();
                    let body: String = body.chars().take(MAX_ERROR_BODY).collect();
                    return Err(app_err!("GitHub API returned {status} for '{url}': {body}"));
                }

                ApiResult::Failed(e) => {
                    return Err(e.enrich_with(|| format!("requesting '{url}'")));
                }
            }
        }
    }
}

/// How long to stop admitting after the server reported an exhausted quota.
fn rate_limit_pause(window: Option<&RateWindow>, retry_after: Option<Duration>, now: DateTime<Utc>, max_wait: Duration) -> Duration {
    let until_reset = window.map(|w| (w.reset_at - now).to_std().unwrap_or_default());

    retry_after
        .or(until_reset)
        .unwrap_or(DEFAULT_RATE_LIMIT_PAUSE)
        .min(max_wait)
        .max(MIN_RATE_LIMIT_PAUSE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings() -> RateLimitSettings {
        RateLimitSettings {
            concurrency: 2,
            rate_limit_per_hour: Some(3_600_000),
            default_rate_limit_per_hour: 5000,
            max_rate_limit_wait: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_hooks() {
        assert_eq!(skip_not_found(StatusCode::NOT_FOUND), ResponseAction::Skip);
        assert_eq!(skip_not_found(StatusCode::CONFLICT), ResponseAction::Proceed);
        assert_eq!(skip_missing_commit(StatusCode::CONFLICT), ResponseAction::Skip);
        assert_eq!(skip_missing_commit(StatusCode::UNPROCESSABLE_ENTITY), ResponseAction::Proceed);
        assert_eq!(skip_missing_commit(StatusCode::OK), ResponseAction::Proceed);
    }

    #[test]
    fn test_rate_limit_pause() {
        let now = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
        let window = RateWindow {
            ceiling: None,
            remaining: 0,
            reset_at: now + chrono::Duration::seconds(120),
            observed_at: now,
        };
        let max = Duration::from_secs(3600);

        assert_eq!(rate_limit_pause(Some(&window), None, now, max), Duration::from_secs(120));
        assert_eq!(rate_limit_pause(Some(&window), Some(Duration::from_secs(7)), now, max), Duration::from_secs(7));
        assert_eq!(rate_limit_pause(None, None, now, max), DEFAULT_RATE_LIMIT_PAUSE);
        assert_eq!(rate_limit_pause(Some(&window), None, now, Duration::from_secs(30)), Duration::from_secs(30));
        assert_eq!(rate_limit_pause(Some(&window), None, now + chrono::Duration::hours(1), max), MIN_RATE_LIMIT_PAUSE);
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
    async fn connect_seeds_governor_from_override() {
        let server = MockServer::start().await;
        let client = ApiClient::new(&[], &server.uri()).unwrap();

        let executor = RequestExecutor::connect(client, &settings()).await;
        assert_eq!(executor.governor().current_interval(), Duration::from_millis(1));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
    async fn connect_seeds_governor_from_quota() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rate_limit"))
            .respond_with(ResponseTemplate::new(200).insert_header("x-ratelimit-limit", "1800"))
            .mount(&server)
            .await;

        let client = ApiClient::new(&["t1".into(), "t2".into()], &server.uri()).unwrap();
        let settings = RateLimitSettings {
            rate_limit_per_hour: None,
            ..settings()
        };

        let executor = RequestExecutor::connect(client, &settings).await;
        assert_eq!(executor.governor().current_interval(), Duration::from_secs(1));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
    async fn fetch_applies_after_response_hook() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(422).set_body_string("Validation Failed"))
            .mount(&server)
            .await;

        let client = ApiClient::new(&[], &server.uri()).unwrap();
        let executor = RequestExecutor::connect(client.clone(), &settings()).await;

        let gone = executor.fetch(&client.endpoint_url("gone").unwrap(), None, skip_not_found).await.unwrap();
        assert!(matches!(gone, Fetched::Skipped(StatusCode::NOT_FOUND)));

        let err = executor.fetch(&client.endpoint_url("bad").unwrap(), None, skip_not_found).await.unwrap_err();
        assert!(format!("{err}").contains("422"));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
    async fn fetch_waits_out_exhausted_quota() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(403).insert_header("x-ratelimit-remaining", "0"))
            .up_to_n_times(1)
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/items"))
            .respond_with(ResponseTemplate::new(200).set_body_string("[]"))
            .mount(&server)
            .await;

        let client = ApiClient::new(&[], &server.uri()).unwrap();
        let executor = RequestExecutor::connect(client.clone(), &settings()).await;

        let start = tokio::time::Instant::now();
        let fetched = executor.fetch(&client.endpoint_url("items").unwrap(), None, skip_not_found).await.unwrap();

        assert!(matches!(fetched, Fetched::Page(ref page) if page.body.as_ref() == b"[]"));
        assert!(start.elapsed() >= Duration::from_millis(900));
    }
}
