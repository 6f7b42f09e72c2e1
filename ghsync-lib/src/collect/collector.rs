//! The stateful collector: one run of one endpoint over a stream of work items.
//!
//! A run moves through `Init` (template, sync decision, work items, quota query), `Paging`
//! (items are paged concurrently, pages of one item strictly in order), and ends in `Done`,
//! where the run's start time is saved as the cursor for the next incremental run. The
//! first fatal error stops admitting items, lets in-flight items finish, and is returned
//! without saving the cursor. Cancellation behaves the same way.

use super::dedup::{BatchDeduplicator, KeyedRecord};
use super::endpoint::Endpoint;
use super::executor::{Fetched, RateLimitSettings, RequestExecutor};
use super::request_tracker::RequestTracker;
use super::sync_state::{ExistingRows, SyncState};
use super::url_template::UrlTemplate;
use super::work_items::{WorkItem, WorkItems};
use super::{ApiClient, Progress};
use crate::Result;
use crate::store::{CollectionParams, NewRawRecord, PayloadEncoding, SqliteStore, WriteMode, WriteOutcome, api_timestamp};
use chrono::Utc;
use core::fmt::{Display, Formatter};
use core::future::ready;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use ohno::{AppError, EnrichableExt, IntoAppError, bail};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use url::Url;

const LOG_TARGET: &str = " collector";

/// Tuning of a collection run.
#[derive(Debug, Clone, Copy)]
pub struct CollectOptions {
    pub page_size: u32,
    pub max_pages_per_item: u32,
    /// Rows read per batch by work-item queries.
    pub batch_size: u32,
    pub full_sync: bool,
    pub limits: RateLimitSettings,
}

/// Everything a sub-task needs to run against one repository.
#[derive(Debug, Clone)]
pub struct CollectContext {
    pub store: SqliteStore,
    pub client: ApiClient,
    pub params: CollectionParams,
    pub options: CollectOptions,
    /// Flips to `true` when the user asks the run to stop.
    pub cancel: watch::Receiver<bool>,
    pub tracker: RequestTracker,
}

impl CollectContext {
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    #[must_use]
    pub fn progress(&self) -> &Arc<dyn Progress> {
        self.tracker.progress()
    }
}

/// Produces the work items of a run.
pub type WorkItemsFn<T> = fn(&SqliteStore, &CollectionParams, &SyncState, u32) -> Result<WorkItems<T>>;

/// A collection sub-task: which endpoint, over which work items.
#[derive(Debug)]
pub struct CollectSpec<T> {
    pub name: &'static str,
    pub endpoint: Endpoint,
    pub existing_rows: ExistingRows,
    pub work_items: WorkItemsFn<T>,
}

/// What a completed run did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectSummary {
    pub sync: SyncState,
    pub items: u64,
    pub pages: u64,
    /// Records stored for the first time.
    pub records_inserted: u64,
    /// Stored records replaced with a fresh copy.
    pub records_updated: u64,
    /// Writes absorbed because the record was already stored.
    pub duplicates: u64,
    /// Items whose response the endpoint treats as empty, such as a 404.
    pub skipped: u64,
    /// Records dropped because they repeated within one page.
    pub dropped: u64,
}

impl Display for CollectSummary {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{} sync: {} items, {} pages, {} records new, {} updated",
            self.sync.mode, self.items, self.pages, self.records_inserted, self.records_updated
        )?;

        if self.duplicates > 0 {
            write!(f, ", {} duplicates", self.duplicates)?;
        }

        if self.skipped > 0 {
            write!(f, ", {} not found", self.skipped)?;
        }

        if self.dropped > 0 {
            write!(f, ", {} repeated in page", self.dropped)?;
        }

        Ok(())
    }
}

#[derive(Debug, Default)]
struct RunCounters {
    items: AtomicU64,
    pages: AtomicU64,
    records_inserted: AtomicU64,
    records_updated: AtomicU64,
    duplicates: AtomicU64,
    skipped: AtomicU64,
    dropped: AtomicU64,
}

impl RunCounters {
    fn bump(counter: &AtomicU64, by: u64) {
        let _ = counter.fetch_add(by, Ordering::Relaxed);
    }

    fn summary(&self, sync: SyncState) -> CollectSummary {
        CollectSummary {
            sync,
            items: self.items.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            records_inserted: self.records_inserted.load(Ordering::Relaxed),
            records_updated: self.records_updated.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Runs one [`CollectSpec`] to completion.
#[derive(Debug)]
pub struct StatefulCollector<'a, T> {
    ctx: &'a CollectContext,
    spec: CollectSpec<T>,
}

impl<'a, T: WorkItem> StatefulCollector<'a, T> {
    #[must_use]
    pub const fn new(ctx: &'a CollectContext, spec: CollectSpec<T>) -> Self {
        Self { ctx, spec }
    }

    pub async fn execute(self) -> Result<CollectSummary> {
        let started_at = Utc::now();
        let Self { ctx, spec } = self;
        let name = spec.name;

        let template = UrlTemplate::parse(spec.endpoint.url_template)
            .and_then(|template| template.check_fields::<T>().map(|()| template))
            .map_err(|e| e.enrich_with(|| format!("preparing task '{name}'")))?;

        let params_key = ctx.params.to_key()?;
        let sync = SyncState::resolve(
            &ctx.store,
            spec.endpoint.raw_table,
            spec.existing_rows,
            &params_key,
            ctx.options.full_sync,
        )
        .map_err(|e| e.enrich_with(|| format!("deciding sync mode for task '{name}'")))?;

        log::info!(
            target: LOG_TARGET,
            "Collecting {name} for {} ({} sync, {} existing rows)",
            ctx.params,
            sync.mode,
            sync.existing_record_count
        );

        let items = (spec.work_items)(&ctx.store, &ctx.params, &sync, ctx.options.batch_size)
            .map_err(|e| e.enrich_with(|| format!("building work items for task '{name}'")))?;

        let executor = RequestExecutor::connect(ctx.client.clone(), &ctx.options.limits).await;

        let run = Run {
            ctx,
            endpoint: spec.endpoint,
            name,
            template,
            executor,
            sync,
            params_key,
            counters: RunCounters::default(),
            failed: AtomicBool::new(false),
            first_error: Mutex::new(None),
        };

        run.page_all(items).await;

        if let Some(e) = run.take_error() {
            return Err(e);
        }

        if ctx.is_cancelled() {
            bail!("task '{name}' was cancelled before it completed");
        }

        ctx.store
            .save_state(spec.endpoint.raw_table, &run.params_key, started_at)
            .map_err(|e| e.enrich_with(|| format!("saving progress of task '{name}'")))?;

        let summary = run.counters.summary(sync);
        log::info!(target: LOG_TARGET, "Finished {name} for {}: {summary}", ctx.params);
        Ok(summary)
    }
}

/// State shared by the items of one run.
#[derive(Debug)]
struct Run<'a> {
    ctx: &'a CollectContext,
    endpoint: Endpoint,
    name: &'static str,
    template: UrlTemplate,
    executor: RequestExecutor,
    sync: SyncState,
    params_key: String,
    counters: RunCounters,
    failed: AtomicBool,
    first_error: Mutex<Option<AppError>>,
}

impl Run<'_> {
    fn should_stop(&self) -> bool {
        self.failed.load(Ordering::Acquire) || self.ctx.is_cancelled()
    }

    fn fail(&self, error: AppError) {
        self.failed.store(true, Ordering::Release);

        let mut first = self.first_error.lock().expect("lock not poisoned");
        if first.is_none() {
            *first = Some(error);
        } else {
            log::debug!(target: LOG_TARGET, "Additional failure in task '{}': {error:#}", self.name);
        }
    }

    fn take_error(&self) -> Option<AppError> {
        self.first_error.lock().expect("lock not poisoned").take()
    }

    async fn page_all<T: WorkItem>(&self, items: WorkItems<T>) {
        blocking_items(items)
            .take_while(|_| ready(!self.should_stop()))
            .map(|item| self.collect_item(item))
            .buffer_unordered(self.ctx.options.limits.concurrency.max(1))
            .for_each(|result| {
                if let Err(e) = result {
                    self.fail(e);
                }
                ready(())
            })
            .await;
    }

    async fn collect_item<T: WorkItem>(&self, item: Result<T>) -> Result<()> {
        let item = item.map_err(|e| e.enrich_with(|| format!("reading work items for task '{}'", self.name)))?;

        RunCounters::bump(&self.counters.items, 1);
        self.ctx.tracker.item_started();

        let result = self.page_item(&item).await;
        self.ctx.tracker.item_finished();
        result
    }

    async fn page_item<T: WorkItem>(&self, item: &T) -> Result<()> {
        let path = self.template.render(&self.ctx.params, item)?;
        let base = self.item_url(&path)?;
        let input = item.input()?;
        let page_size = self.ctx.options.page_size.max(1);

        let mut last_page = None;
        let item_key = item.key();

        for page in 1..=self.ctx.options.max_pages_per_item {
            if self.should_stop() {
                return Ok(());
            }

            let mut url = base.clone();
            let _ = url
                .query_pairs_mut()
                .append_pair("per_page", &page_size.to_string())
                .append_pair("page", &page.to_string());

            self.ctx.tracker.set_paused(self.executor.governor().is_paused());
            self.ctx.tracker.page_started();
            let fetched = self
                .executor
                .fetch(&url, self.endpoint.accept, self.endpoint.after_response)
                .await;
            self.ctx.tracker.page_finished();

            let fetched = fetched.map_err(|e| e.enrich_with(|| format!("collecting {} from '{path}'", self.name)))?;
            let api_page = match fetched {
                Fetched::Page(api_page) => api_page,
                Fetched::Skipped(status) => {
                    log::debug!(target: LOG_TARGET, "No {} at '{path}' ({status})", self.name);
                    RunCounters::bump(&self.counters.skipped, 1);
                    return Ok(());
                }
            };

            RunCounters::bump(&self.counters.pages, 1);

            let parsed = self.endpoint.parse_page(&api_page, page_size)?;
            if parsed.total_pages.is_some() {
                last_page = parsed.total_pages;
            }

            let count = parsed.records.len();
            if count == 0 {
                return Ok(());
            }

            self.store_records(parsed.records, &api_page.url, input.as_deref(), &item_key)
                .await
                .map_err(|e| e.enrich_with(|| format!("storing {} from '{path}'", self.name)))?;

            let finished = match last_page {
                Some(last) => page >= last,
                None => count < page_size as usize,
            };

            if finished {
                return Ok(());
            }
        }

        log::warn!(
            target: LOG_TARGET,
            "Stopped paging '{path}' after {} pages; raise max_pages_per_item to collect the rest",
            self.ctx.options.max_pages_per_item
        );

        Ok(())
    }

    /// The item's URL with the endpoint's fixed query and, for incremental runs, its `since` filter.
    fn item_url(&self, path: &str) -> Result<Url> {
        let mut url = self.ctx.client.endpoint_url(path)?;

        {
            let mut query = url.query_pairs_mut();
            for (name, value) in self.endpoint.query {
                let _ = query.append_pair(name, value);
            }

            if let (Some(param), Some(since)) = (self.endpoint.since_param, self.sync.since) {
                let _ = query.append_pair(param.name, &format!("{}{}", param.prefix, api_timestamp(since)));
            }
        }

        Ok(url)
    }

    async fn store_records(&self, records: Vec<Value>, source_url: &Url, input: Option<&str>, item_key: &str) -> Result<()> {
        let dedup = BatchDeduplicator::new(
            self.endpoint.record_key,
            self.ctx.client.base_url(),
            &self.ctx.params.name,
            source_url.as_str(),
        )
        .with_item_key(item_key);

        let batch = dedup.dedup(records);
        RunCounters::bump(&self.counters.dropped, batch.dropped);

        let write = BatchWrite {
            store: self.ctx.store.clone(),
            task: self.name,
            raw_table: self.endpoint.raw_table,
            params: self.params_key.clone(),
            mode: self.endpoint.write_mode,
            source_url: source_url.to_string(),
            input: input.map(str::to_string),
            records: batch.records,
        };

        let counts = tokio::task::spawn_blocking(move || write.apply())
            .await
            .into_app_err("record write task panicked")??;

        RunCounters::bump(&self.counters.records_inserted, counts.inserted);
        RunCounters::bump(&self.counters.records_updated, counts.updated);
        RunCounters::bump(&self.counters.duplicates, counts.duplicates);
        self.ctx.tracker.add_records(counts.inserted + counts.updated);
        Ok(())
    }
}

/// Work items pulled on the blocking pool, since advancing a query cursor may read the store.
fn blocking_items<T: WorkItem>(items: WorkItems<T>) -> impl Stream<Item = Result<T>> {
    stream::unfold(Some(items), |state| async move {
        let mut items = state?;
        let advanced = tokio::task::spawn_blocking(move || {
            let next = items.next();
            (next, items)
        })
        .await;

        match advanced {
            Ok((next, items)) => next.map(|item| (item, Some(items))),
            Err(e) => Some((Err::<T, _>(e).into_app_err("work item query task panicked"), None)),
        }
    })
}

#[derive(Debug, Default)]
struct WriteCounts {
    inserted: u64,
    updated: u64,
    duplicates: u64,
}

/// One deduplicated batch, owned so it can be written off the async workers.
#[derive(Debug)]
struct BatchWrite {
    store: SqliteStore,
    task: &'static str,
    raw_table: &'static str,
    params: String,
    mode: WriteMode,
    source_url: String,
    input: Option<String>,
    records: Vec<KeyedRecord>,
}

impl BatchWrite {
    fn apply(self) -> Result<WriteCounts> {
        let mut counts = WriteCounts::default();

        for KeyedRecord { key, record } in self.records {
            let payload = serde_json::to_vec(&record).into_app_err("serializing record")?;
            let new = NewRawRecord {
                raw_table: self.raw_table,
                params: &self.params,
                payload: &payload,
                encoding: PayloadEncoding::Json,
                source_url: &self.source_url,
                input: self.input.as_deref(),
                dedup_key: &key,
            };

            match self.store.insert_raw(&new, self.mode) {
                Ok(WriteOutcome::Inserted) => counts.inserted += 1,
                Ok(WriteOutcome::Updated) => counts.updated += 1,
                Err(e) if e.is_constraint_violation() => {
                    log::debug!(target: LOG_TARGET, "Already stored {} '{key}'", self.task);
                    counts.duplicates += 1;
                }
                Err(e) => return Err(AppError::from(e).enrich_with(|| format!("writing record '{key}'"))),
            }
        }

        Ok(counts)
    }
}
