//! Counters behind the collection progress bar.

use super::progress::Progress;
use core::fmt::{Debug, Formatter};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use owo_colors::OwoColorize;
use std::sync::Arc;

const PAUSED_NOTE: &str = "paused for the rate limit";

#[derive(Debug, Default)]
struct Counters {
    items_started: AtomicU64,
    items_finished: AtomicU64,
    pages_started: AtomicU64,
    pages_finished: AtomicU64,
    records: AtomicU64,
    paused: AtomicBool,
}

/// Counts the items, pages and records of one collection run.
///
/// The bar length is the number of items started so far, since work items are read lazily
/// and pages per item are unknown until the first page arrives. Clones share counters.
#[derive(Clone)]
pub struct RequestTracker {
    counters: Arc<Counters>,
    progress: Arc<dyn Progress>,
}

impl Debug for RequestTracker {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RequestTracker")
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl RequestTracker {
    #[must_use]
    pub fn new(progress: &Arc<dyn Progress>) -> Self {
        let counters: Arc<Counters> = Arc::default();

        let shared = Arc::clone(&counters);
        let use_colors = progress.use_colors();
        progress.set_determinate(Box::new(move || render(&shared, use_colors)));

        Self {
            counters,
            progress: Arc::clone(progress),
        }
    }

    #[must_use]
    pub fn progress(&self) -> &Arc<dyn Progress> {
        &self.progress
    }

    pub fn item_started(&self) {
        let _ = self.counters.items_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn item_finished(&self) {
        let _ = self.counters.items_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_started(&self) {
        let _ = self.counters.pages_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn page_finished(&self) {
        let _ = self.counters.pages_finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_records(&self, count: u64) {
        let _ = self.counters.records.fetch_add(count, Ordering::Relaxed);
    }

    /// Whether admissions are currently held back by a quota pause.
    pub fn set_paused(&self, paused: bool) {
        self.counters.paused.store(paused, Ordering::Relaxed);
    }
}

/// Returns (`total`, `position`, `message`) for the progress bar.
fn render(counters: &Counters, use_colors: bool) -> (u64, u64, String) {
    let started = counters.items_started.load(Ordering::Relaxed);
    let finished = counters.items_finished.load(Ordering::Relaxed);
    if started == 0 {
        return (0, 0, "Reading work items".to_string());
    }

    let pages = counters.pages_finished.load(Ordering::Relaxed);
    let in_flight = counters.pages_started.load(Ordering::Relaxed).saturating_sub(pages);
    let records = counters.records.load(Ordering::Relaxed);

    let mut message = format!("{finished}/{started} items, {pages} pages ({in_flight} in flight), {records} records");
    if counters.paused.load(Ordering::Relaxed) {
        message.push_str(", ");
        if use_colors {
            message.push_str(&PAUSED_NOTE.yellow().to_string());
        } else {
            message.push_str(PAUSED_NOTE);
        }
    }

    (started, finished, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct NoOpProgress;

    impl Progress for NoOpProgress {
        fn set_phase(&self, _phase: &str) {}
        fn set_determinate(&self, _callback: Box<dyn Fn() -> (u64, u64, String) + Send + Sync + 'static>) {}
        fn set_indeterminate(&self, _callback: Box<dyn Fn() -> String + Send + Sync + 'static>) {}
        fn done(&self) {}
    }

    fn tracker() -> RequestTracker {
        RequestTracker::new(&(Arc::new(NoOpProgress) as Arc<dyn Progress>))
    }

    #[test]
    fn nothing_started() {
        let tracker = tracker();
        assert_eq!(render(&tracker.counters, false), (0, 0, "Reading work items".to_string()));
    }

    #[test]
    fn items_drive_the_bar() {
        let tracker = tracker();
        for _ in 0..4 {
            tracker.item_started();
        }
        tracker.item_finished();
        for _ in 0..3 {
            tracker.page_started();
        }
        tracker.page_finished();
        tracker.page_finished();
        tracker.add_records(250);

        let (total, position, message) = render(&tracker.counters, false);
        assert_eq!(total, 4);
        assert_eq!(position, 1);
        assert_eq!(message, "1/4 items, 2 pages (1 in flight), 250 records");
    }

    #[test]
    fn pause_is_shown_until_cleared() {
        let tracker = tracker();
        tracker.item_started();
        tracker.set_paused(true);

        let (_, _, plain) = render(&tracker.counters, false);
        assert!(plain.ends_with(", paused for the rate limit"), "got: {plain}");

        let (_, _, colored) = render(&tracker.counters, true);
        assert!(colored.contains("\x1b[33m"));

        tracker.set_paused(false);
        let (_, _, cleared) = render(&tracker.counters, false);
        assert!(!cleared.contains("paused"));
    }

    #[test]
    fn clones_share_counters() {
        let tracker = tracker();
        tracker.item_started();

        let clone = tracker.clone();
        clone.item_finished();

        let (total, position, _) = render(&tracker.counters, false);
        assert_eq!((total, position), (1, 1));
    }
}
