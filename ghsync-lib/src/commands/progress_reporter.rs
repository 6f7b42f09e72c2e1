use crate::collect::Progress;
use core::fmt::{Debug, Formatter};
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::task::JoinHandle;

type ProgressCallback = Box<dyn Fn() -> (u64, u64, String) + Send + Sync>;

const REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// What the refresh task reads on every tick.
struct Shared {
    visible_after: Instant,
    visible: AtomicBool,
    callback: Mutex<ProgressCallback>,

    /// Set while extracting; the message is then prefixed with the seconds spent so far.
    spinning_since: Mutex<Option<Instant>>,
}

/// A progress bar on stderr that stays hidden for short runs.
///
/// Collection runs that finish within the delay never draw anything, which keeps
/// scripted and logged invocations clean.
#[derive(Clone)]
pub struct ProgressReporter {
    bar: ProgressBar,
    shared: Arc<Shared>,
    refresh_task: Arc<JoinHandle<()>>,
    use_colors: bool,
}

impl ProgressReporter {
    /// Create a reporter that becomes visible once `delay` has elapsed.
    ///
    /// Must be called within a Tokio runtime, since it spawns the refresh task.
    #[must_use]
    pub fn new(delay: Duration, use_colors: bool) -> Self {
        let bar = ProgressBar::hidden();
        let shared = Arc::new(Shared {
            visible_after: Instant::now() + delay,
            visible: AtomicBool::new(false),
            callback: Mutex::new(Box::new(|| (0_u64, 0_u64, String::new())) as ProgressCallback),
            spinning_since: Mutex::new(None),
        });

        Self {
            refresh_task: Arc::new(tokio::spawn(refresh(bar.clone(), Arc::clone(&shared)))),
            bar,
            shared,
            use_colors,
        }
    }

    fn style(&self, spinner: bool) -> ProgressStyle {
        let prefix = if self.use_colors { "{prefix:>12.bold.cyan}" } else { "{prefix:>12}" };
        if spinner {
            ProgressStyle::default_spinner()
                .template(&format!("{prefix} {{spinner}} {{msg}}"))
                .expect("could not create progress bar style")
                .tick_chars("|/-\\ ")
        } else {
            ProgressStyle::default_bar()
                .template(&format!("{prefix} [{{bar:25}}] {{msg}}"))
                .expect("could not create progress bar style")
                .progress_chars("=> ")
        }
    }
}

impl Progress for ProgressReporter {
    fn set_phase(&self, phase: &str) {
        self.bar.set_prefix(phase.to_string());
    }

    fn set_determinate(&self, callback: Box<dyn Fn() -> (u64, u64, String) + Send + Sync + 'static>) {
        *self.shared.callback.lock().expect("lock not poisoned") = callback;
        *self.shared.spinning_since.lock().expect("lock not poisoned") = None;

        self.bar.disable_steady_tick();
        self.bar.set_length(0);
        self.bar.set_position(0);
        self.bar.set_style(self.style(false));
    }

    fn set_indeterminate(&self, callback: Box<dyn Fn() -> String + Send + Sync + 'static>) {
        *self.shared.callback.lock().expect("lock not poisoned") = Box::new(move || (0, 0, callback()));
        *self.shared.spinning_since.lock().expect("lock not poisoned") = Some(Instant::now());

        self.bar.enable_steady_tick(REFRESH_INTERVAL);
        self.bar.set_style(self.style(true));
    }

    fn use_colors(&self) -> bool {
        self.use_colors
    }

    fn done(&self) {
        self.refresh_task.abort();
        if self.shared.visible.load(Ordering::Relaxed) {
            self.bar.finish_and_clear();
        }
    }
}

impl Debug for ProgressReporter {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("bar", &self.bar)
            .field("visible", &self.shared.visible)
            .field("use_colors", &self.use_colors)
            .finish_non_exhaustive()
    }
}

async fn refresh(bar: ProgressBar, shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    #[expect(clippy::infinite_loop, reason = "task runs until aborted")]
    loop {
        let _ = interval.tick().await;

        if !shared.visible.load(Ordering::Relaxed) {
            if Instant::now() < shared.visible_after {
                continue;
            }
            shared.visible.store(true, Ordering::Relaxed);
            bar.set_draw_target(ProgressDrawTarget::stderr_with_hz(10));
        }

        let (length, position, mut message) = {
            let callback = shared.callback.lock().expect("lock not poisoned");
            callback()
        };

        let spinning_since = *shared.spinning_since.lock().expect("lock not poisoned");
        if let Some(since) = spinning_since {
            message = format!("{}s: {message}", since.elapsed().as_secs());
        }

        if length > 0 {
            bar.set_length(length);
            bar.set_position(position);
        }
        bar.set_message(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
    async fn hidden_reporter_accepts_every_call() {
        let reporter = ProgressReporter::new(Duration::from_secs(3600), false);
        reporter.set_phase("Collecting");
        reporter.set_determinate(Box::new(|| (10, 3, "3/10 items".to_string())));
        reporter.set_indeterminate(Box::new(|| "extracting".to_string()));
        assert!(reporter.shared.spinning_since.lock().unwrap().is_some());
        assert!(!reporter.use_colors());
        reporter.done();
        assert!(!reporter.shared.visible.load(Ordering::Relaxed));
    }

    #[tokio::test]
    #[cfg_attr(miri, ignore = "Miri cannot call CreateIoCompletionPort on Windows")]
    async fn determinate_phase_clears_the_spinner_clock() {
        let reporter = ProgressReporter::new(Duration::from_secs(3600), true);
        reporter.set_indeterminate(Box::new(String::new));
        reporter.set_determinate(Box::new(|| (1, 0, String::new())));
        assert!(reporter.shared.spinning_since.lock().unwrap().is_none());
        reporter.done();
    }
}
