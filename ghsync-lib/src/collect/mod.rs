//! Rate-governed collection of paginated GitHub API data.
//!
//! # Implementation Model
//!
//! Every collection run owns a [`Governor`], a ticking admission gate with a concurrency
//! cap. The run starts by querying the server's quota, which yields a static ceiling
//! that seeds the governor's interval, and every response afterwards feeds its
//! `x-ratelimit-*` headers to a [`RateLimitCalculator`], which retunes the governor when
//! the proposed interval leaves a ±10% band around the current one. When the quota is
//! exhausted the governor pauses until the window resets, so the server never has to
//! reject a request for pacing reasons.
//!
//! The [`StatefulCollector`] drives one endpoint over a lazy sequence of [`WorkItem`]s read
//! from previously stored rows. Pages of one item are fetched in order, deduplicated
//! within the page, and written before the next page is requested. A run that completes
//! saves its start time; the next run only asks for what changed since then.

mod client;
mod collector;
mod cursor;
mod dedup;
mod endpoint;
mod executor;
mod governor;
mod progress;
mod rate_limit;
mod request_tracker;
mod resilient_http;
mod sync_state;
mod url_template;
mod work_items;

pub use client::{ApiClient, ApiResult, DEFAULT_ACCEPT, DEFAULT_BASE_URL, QuotaReport};
pub use collector::{CollectContext, CollectOptions, CollectSpec, CollectSummary, StatefulCollector, WorkItemsFn};
pub use cursor::RowCursor;
pub use dedup::{BatchDeduplicator, DedupedBatch, KeyedRecord};
pub use endpoint::{Endpoint, PageHint, ParsedPage, RecordKey, ResponseShape, SinceParam, last_page_from_link};
pub use executor::{
    AfterResponse, ApiPage, Fetched, RateLimitSettings, RequestExecutor, ResponseAction, skip_missing_commit, skip_not_found,
};
pub use governor::{Governor, MIN_INTERVAL};
pub use progress::Progress;
pub use rate_limit::{Adjustment, PendingCalculator, RateLimitCalculator, RateWindow, StaticCeiling, target_interval};
pub use request_tracker::RequestTracker;
pub use sync_state::{ExistingRows, SyncMode, SyncState};
pub use url_template::UrlTemplate;
pub use work_items::{RepoScope, WorkItem, WorkItems};
