//! Derives a safe request cadence from the server's advertised quota.
//!
//! Two sources feed the cadence:
//!
//! - A static ceiling, known before the first real request: an explicit override, or the
//!   advertised `X-RateLimit-Limit` multiplied by the number of rotated tokens, or a
//!   configured default. It seeds the [`Governor`] with `window / ceiling`.
//! - Live [`RateWindow`]s read from every response. Each yields a target interval of
//!   `time_until_reset / (remaining × SAFETY_FACTOR)`, applied only when it differs from the
//!   current interval by more than [`HYSTERESIS_BAND`].
//!
//! Construction happens in two phases. The quota response produces a [`PendingCalculator`],
//! the governor is built from its ceiling, and [`PendingCalculator::bind`] then applies the
//! quota response's window exactly once. No observation is buffered after that point.

use super::governor::{Governor, MIN_INTERVAL};
use chrono::{DateTime, Utc};
use core::str::FromStr;
use core::time::Duration;
use reqwest::header::{DATE, HeaderMap};
use std::sync::Arc;

const LOG_TARGET: &str = " ratelimit";

/// Fraction of the remaining quota the collector allows itself to spend.
pub const SAFETY_FACTOR: f64 = 0.95;

/// Relative change below which a new interval is ignored.
pub const HYSTERESIS_BAND: f64 = 0.10;

/// The window the static ceiling applies to.
pub const STATIC_WINDOW: Duration = Duration::from_secs(3600);

/// Quota state reported by one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindow {
    /// Requests allowed per window, when advertised.
    pub ceiling: Option<u32>,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// The server's clock when the response was produced.
    pub observed_at: DateTime<Utc>,
}

impl RateWindow {
    /// Read the quota headers of a response.
    ///
    /// Returns `None` when `X-RateLimit-Remaining`, `X-RateLimit-Reset`, or `Date` is absent or
    /// malformed.
    #[must_use]
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let remaining = header_value::<u32>(headers, "x-ratelimit-remaining")?;
        let reset_at = DateTime::from_timestamp(header_value::<i64>(headers, "x-ratelimit-reset")?, 0)?;
        let date = headers.get(DATE)?.to_str().ok()?;
        let observed_at = DateTime::parse_from_rfc2822(date).ok()?.with_timezone(&Utc);

        Some(Self {
            ceiling: header_value(headers, "x-ratelimit-limit"),
            remaining,
            reset_at,
            observed_at,
        })
    }

    /// Time left in the window, measured on the server's clock. `None` once the window has reset.
    #[must_use]
    pub fn time_until_reset(&self) -> Option<Duration> {
        (self.reset_at - self.observed_at).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Parse a numeric header value.
pub fn header_value<T: FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

/// The interval that spends `SAFETY_FACTOR` of the remaining quota evenly until reset.
///
/// Returns `None` when the window has already reset or no quota remains.
#[must_use]
pub fn target_interval(window: &RateWindow) -> Option<Duration> {
    let until_reset = window.time_until_reset()?;
    let rate = f64::from(window.remaining) * SAFETY_FACTOR / until_reset.as_secs_f64();
    if rate <= 0.0 || !rate.is_finite() {
        return None;
    }

    Duration::try_from_secs_f64(1.0 / rate).ok().map(|d| d.max(MIN_INTERVAL))
}

/// Whether `proposed` differs from `current` by more than [`HYSTERESIS_BAND`].
#[must_use]
pub fn outside_band(current: Duration, proposed: Duration) -> bool {
    let current = current.as_secs_f64();
    let proposed = proposed.as_secs_f64();
    proposed < current * (1.0 - HYSTERESIS_BAND) || proposed > current * (1.0 + HYSTERESIS_BAND)
}

/// Requests allowed per [`STATIC_WINDOW`] before any live signal is seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticCeiling {
    pub requests: u32,
}

impl StaticCeiling {
    /// Pick the ceiling from, in order: an explicit override, the advertised per-token limit
    /// times the token count, or the configured default.
    #[must_use]
    pub fn resolve(override_per_hour: Option<u32>, advertised_limit: Option<u32>, token_count: usize, default_per_hour: u32) -> Self {
        let tokens = u32::try_from(token_count.max(1)).unwrap_or(u32::MAX);
        let requests = override_per_hour
            .or_else(|| advertised_limit.map(|limit| limit.saturating_mul(tokens)))
            .unwrap_or(default_per_hour);

        Self {
            requests: requests.max(1),
        }
    }

    /// The interval that spreads the ceiling evenly over the window.
    #[must_use]
    pub fn interval(&self) -> Duration {
        (STATIC_WINDOW / self.requests).max(MIN_INTERVAL)
    }
}

/// What an observation did to the governor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// The interval was replaced.
    Applied { from: Duration, to: Duration },

    /// The target interval was too close to the current one.
    WithinBand { current: Duration, proposed: Duration },

    /// The signal was absent or unusable.
    Skipped,
}

/// A calculator that has seen the quota response but has no governor yet.
#[derive(Debug, Clone, Copy)]
pub struct PendingCalculator {
    ceiling: StaticCeiling,
    first_window: Option<RateWindow>,
}

impl PendingCalculator {
    #[must_use]
    pub const fn new(ceiling: StaticCeiling, first_window: Option<RateWindow>) -> Self {
        Self { ceiling, first_window }
    }

    #[must_use]
    pub const fn ceiling(&self) -> StaticCeiling {
        self.ceiling
    }

    /// Interval to seed the governor with.
    #[must_use]
    pub fn initial_interval(&self) -> Duration {
        self.ceiling.interval()
    }

    /// Attach the governor and apply the quota response's window.
    pub fn bind(self, governor: Arc<Governor>) -> RateLimitCalculator {
        let calculator = RateLimitCalculator { governor };
        if let Some(window) = self.first_window {
            let _ = calculator.observe(Some(&window));
        }
        calculator
    }
}

/// Retunes a [`Governor`] from live quota signals.
#[derive(Debug, Clone)]
pub struct RateLimitCalculator {
    governor: Arc<Governor>,
}

impl RateLimitCalculator {
    /// Adjust the governor to the quota reported by one response.
    pub fn observe(&self, window: Option<&RateWindow>) -> Adjustment {
        let Some(window) = window else {
            log::trace!(target: LOG_TARGET, "Response carried no usable rate limit headers");
            return Adjustment::Skipped;
        };

        let Some(proposed) = target_interval(window) else {
            log::debug!(
                target: LOG_TARGET,
                "Skipping adjustment: {} requests remaining, window resets at {}",
                window.remaining,
                window.reset_at
            );
            return Adjustment::Skipped;
        };

        let current = self.governor.current_interval();
        if !outside_band(current, proposed) {
            return Adjustment::WithinBand { current, proposed };
        }

        log::info!(
            target: LOG_TARGET,
            "Adjusting request interval from {current:?} to {proposed:?} ({} requests remaining until {})",
            window.remaining,
            window.reset_at.with_timezone(&chrono::Local).format("%T")
        );
        self.governor.reset(proposed);

        Adjustment::Applied {
            from: current,
            to: proposed,
        }
    }

    #[must_use]
    pub const fn governor(&self) -> &Arc<Governor> {
        &self.governor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn window(remaining: u32, seconds_until_reset: i64) -> RateWindow {
        let observed_at = DateTime::from_timestamp(1_704_067_200, 0).unwrap();
        RateWindow {
            ceiling: Some(5000),
            remaining,
            reset_at: observed_at + chrono::Duration::seconds(seconds_until_reset),
            observed_at,
        }
    }

    fn assert_close(actual: Duration, expected_secs: f64) {
        let diff = (actual.as_secs_f64() - expected_secs).abs();
        assert!(diff < 0.01, "expected ~{expected_secs}s, got {actual:?}");
    }

    #[test]
    fn test_from_headers() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-ratelimit-limit", HeaderValue::from_static("5000"));
        let _ = headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4999"));
        let _ = headers.insert("x-ratelimit-reset", HeaderValue::from_static("1704070800"));
        let _ = headers.insert(DATE, HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"));

        let window = RateWindow::from_headers(&headers).unwrap();

        assert_eq!(window.ceiling, Some(5000));
        assert_eq!(window.remaining, 4999);
        assert_eq!(window.reset_at.timestamp(), 1_704_070_800);
        assert_eq!(window.observed_at.timestamp(), 1_704_067_200);
        assert_eq!(window.time_until_reset(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_from_headers_missing_or_malformed() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-ratelimit-remaining", HeaderValue::from_static("4999"));
        let _ = headers.insert("x-ratelimit-reset", HeaderValue::from_static("1704070800"));
        assert!(RateWindow::from_headers(&headers).is_none(), "missing Date");

        let _ = headers.insert(DATE, HeaderValue::from_static("yesterday"));
        assert!(RateWindow::from_headers(&headers).is_none(), "malformed Date");

        let _ = headers.insert(DATE, HeaderValue::from_static("Mon, 01 Jan 2024 00:00:00 GMT"));
        let _ = headers.insert("x-ratelimit-remaining", HeaderValue::from_static("lots"));
        assert!(RateWindow::from_headers(&headers).is_none(), "malformed remaining");
    }

    #[test]
    fn test_target_interval_long_window() {
        let interval = target_interval(&window(100, 3600)).unwrap();
        assert_close(interval, 37.89);
    }

    #[test]
    fn test_target_interval_short_window() {
        let interval = target_interval(&window(100, 60)).unwrap();
        assert_close(interval, 0.6316);
    }

    #[test]
    fn test_target_interval_unusable_windows() {
        assert!(target_interval(&window(100, 0)).is_none(), "already reset");
        assert!(target_interval(&window(100, -30)).is_none(), "reset in the past");
        assert!(target_interval(&window(0, 600)).is_none(), "no quota remaining");
    }

    #[test]
    fn test_hysteresis_band() {
        let current = Duration::from_secs(10);
        assert!(!outside_band(current, Duration::from_millis(10_500)));
        assert!(!outside_band(current, Duration::from_millis(9_500)));
        assert!(!outside_band(current, Duration::from_secs(11)));
        assert!(outside_band(current, Duration::from_millis(11_500)));
        assert!(outside_band(current, Duration::from_millis(8_500)));
    }

    #[test]
    fn test_static_ceiling_precedence() {
        assert_eq!(StaticCeiling::resolve(Some(1000), Some(5000), 3, 60).requests, 1000);
        assert_eq!(StaticCeiling::resolve(None, Some(5000), 3, 60).requests, 15_000);
        assert_eq!(StaticCeiling::resolve(None, Some(5000), 0, 60).requests, 5000);
        assert_eq!(StaticCeiling::resolve(None, None, 3, 60).requests, 60);
        assert_eq!(StaticCeiling::resolve(Some(0), None, 1, 60).requests, 1);
    }

    #[test]
    fn test_static_ceiling_interval() {
        assert_eq!(StaticCeiling { requests: 5000 }.interval(), Duration::from_millis(720));
        assert_eq!(StaticCeiling { requests: u32::MAX }.interval(), MIN_INTERVAL);
    }

    #[test]
    fn observe_applies_outside_band_only() {
        let governor = Governor::new(1, Duration::from_secs(10));
        let calculator = PendingCalculator::new(StaticCeiling { requests: 360 }, None).bind(Arc::clone(&governor));
        assert_eq!(governor.current_interval(), Duration::from_secs(10));

        // 95 usable requests over 1000s is ~10.5s, inside the band
        let result = calculator.observe(Some(&window(100, 1000)));
        assert!(matches!(result, Adjustment::WithinBand { .. }));
        assert_eq!(governor.current_interval(), Duration::from_secs(10));

        let result = calculator.observe(Some(&window(100, 60)));
        assert!(matches!(result, Adjustment::Applied { .. }));
        assert_close(governor.current_interval(), 0.6316);
    }

    #[test]
    fn observe_without_signal_is_a_no_op() {
        let governor = Governor::new(1, Duration::from_secs(2));
        let calculator = PendingCalculator::new(StaticCeiling { requests: 1800 }, None).bind(Arc::clone(&governor));

        assert_eq!(calculator.observe(None), Adjustment::Skipped);
        assert_eq!(calculator.observe(Some(&window(0, 600))), Adjustment::Skipped);
        assert_eq!(governor.current_interval(), Duration::from_secs(2));
    }

    #[test]
    fn bind_applies_quota_window_once() {
        let pending = PendingCalculator::new(StaticCeiling { requests: 5000 }, Some(window(100, 3600)));
        let governor = Governor::new(1, pending.initial_interval());
        assert_eq!(governor.current_interval(), Duration::from_millis(720));

        let _calculator = pending.bind(Arc::clone(&governor));
        assert_close(governor.current_interval(), 37.89);
    }
}
