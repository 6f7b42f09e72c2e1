use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use core::time::Duration;
use std::sync::{Arc, Mutex};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

const LOG_TARGET: &str = "  governor";

/// Shortest interval the governor will tick at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Paces outgoing requests to a fixed cadence that can be retuned while running.
///
/// Wrap in an `Arc` via [`Governor::new`], then call [`Governor::admit`] before each request
/// and hold the returned permit until the response has been read. At most `max_concurrent`
/// requests are in flight, and consecutive admissions are spaced by the current interval.
///
/// [`Governor::reset`] swaps the interval atomically. Each admission reserves its slot as
/// `max(now, previous_slot + interval)` under a short lock, so a reset affects every slot
/// reserved after it, slots reserved before it keep their time, and no admission is ever
/// lost or handed out twice.
///
/// [`Governor::pause_for`] halts admissions entirely, e.g. when the server reports that the
/// quota is exhausted. When multiple tasks pause concurrently, the longest pause wins.
#[derive(Debug)]
pub struct Governor {
    semaphore: Arc<Semaphore>,
    interval_nanos: AtomicU64,
    last_slot: Mutex<Option<Instant>>,
    paused: AtomicBool,
    resume: Notify,
    /// When the current pause should expire.
    resume_at: Mutex<Option<Instant>>,
}

impl Governor {
    /// Create a governor that admits at most `max_concurrent` requests, one per `interval`.
    pub fn new(max_concurrent: usize, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            interval_nanos: AtomicU64::new(to_nanos(interval)),
            last_slot: Mutex::new(None),
            paused: AtomicBool::new(false),
            resume: Notify::new(),
            resume_at: Mutex::new(None),
        })
    }

    /// Wait until unpaused, acquire a concurrency slot, then wait for the next tick.
    pub async fn admit(&self) -> OwnedSemaphorePermit {
        loop {
            let resumed = self.resume.notified();
            if self.paused.load(Ordering::Acquire) {
                resumed.await;
                continue;
            }

            let permit = Arc::clone(&self.semaphore)
                .acquire_owned()
                .await
                .expect("semaphore is never closed");

            // a pause may have started while waiting for the permit
            if self.paused.load(Ordering::Acquire) {
                drop(permit);
                continue;
            }

            let slot = self.reserve_slot();
            tokio::time::sleep_until(slot).await;
            return permit;
        }
    }

    fn reserve_slot(&self) -> Instant {
        let interval = self.current_interval();
        let now = Instant::now();

        let mut last = self.last_slot.lock().expect("lock not poisoned");
        let slot = last.map_or(now, |prev| (prev + interval).max(now));
        *last = Some(slot);
        slot
    }

    /// Replace the tick interval. Values below [`MIN_INTERVAL`] are clamped.
    pub fn reset(&self, interval: Duration) {
        let nanos = to_nanos(interval);
        let previous = self.interval_nanos.swap(nanos, Ordering::AcqRel);
        if previous != nanos {
            log::debug!(
                target: LOG_TARGET,
                "Request interval changed from {:?} to {:?}",
                Duration::from_nanos(previous),
                Duration::from_nanos(nanos)
            );
        }
    }

    /// The interval currently in effect.
    pub fn current_interval(&self) -> Duration {
        Duration::from_nanos(self.interval_nanos.load(Ordering::Acquire))
    }

    /// Returns whether admissions are currently paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Minimum extension required for a new pause to override an active one.
    /// Concurrent requests that all hit the same exhausted quota compute nearly
    /// identical resume times; only the first one establishes the pause.
    const MIN_PAUSE_EXTENSION: Duration = Duration::from_secs(1);

    /// Stop admitting for `duration`, then resume automatically.
    ///
    /// Requests already admitted are not interrupted. Returns `true` only when a new pause
    /// was established, and `false` when an equivalent or longer pause is already active.
    pub fn pause_for(self: &Arc<Self>, duration: Duration) -> bool {
        let new_resume_at = Instant::now() + duration;

        {
            let mut guard = self.resume_at.lock().expect("lock not poisoned");
            if guard.is_some_and(|existing| existing + Self::MIN_PAUSE_EXTENSION >= new_resume_at) {
                return false;
            }
            *guard = Some(new_resume_at);
        }

        self.paused.store(true, Ordering::Release);
        let this = Arc::clone(self);
        drop(tokio::spawn(async move {
            tokio::time::sleep(duration).await;

            let should_resume = {
                let mut guard = this.resume_at.lock().expect("lock not poisoned");
                if guard.is_some_and(|t| Instant::now() >= t) {
                    *guard = None;
                    true
                } else {
                    false // a longer pause was scheduled after us
                }
            };

            if should_resume {
                this.paused.store(false, Ordering::Release);
                this.resume.notify_waiters();
            }
        }));

        true
    }
}

fn to_nanos(interval: Duration) -> u64 {
    u64::try_from(interval.max(MIN_INTERVAL).as_nanos()).unwrap_or(u64::MAX)
}
