use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared progress state of an SBC run.
///
/// Sequential runs bump the counter once per trial, parallel runs once per
/// finished batch (by the batch length). A dedicated thread reads the
/// counters and renders a live bar to stderr.
pub struct SbcProgress {
    pub total_trials: usize,
    pub completed: AtomicUsize,
    pub done: AtomicBool,
    pub start_time: Instant,
    pub num_workers: usize,
    pub num_posterior_samples: usize,
}

impl SbcProgress {
    pub fn new(total_trials: usize, num_workers: usize, num_posterior_samples: usize) -> Self {
        Self {
            total_trials,
            completed: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            start_time: Instant::now(),
            num_workers,
            num_posterior_samples,
        }
    }

    pub fn increment(&self) {
        self.add(1);
    }

    pub fn add(&self, trials: usize) {
        self.completed.fetch_add(trials, Ordering::Relaxed);
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn finish(&self) {
        self.done.store(true, Ordering::Relaxed);
    }
}

fn fmt_count(n: usize) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 10_000 {
        format!("{:.1}k", n as f64 / 1_000.0)
    } else {
        format!("{}", n)
    }
}

fn fmt_speed(n: f64) -> String {
    if n >= 1_000.0 {
        format!("{:.1}k", n / 1_000.0)
    } else if n >= 10.0 {
        format!("{:.0}", n)
    } else {
        format!("{:.1}", n)
    }
}

fn fmt_time(secs: f64) -> String {
    if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = (secs / 60.0) as usize;
        let s = (secs % 60.0) as usize;
        format!("{}:{:02}", mins, s)
    }
}

fn label(state: &SbcProgress) -> String {
    if state.num_workers > 1 {
        format!("Running SBC in parallel ({} workers)", state.num_workers)
    } else {
        "Running SBC".to_string()
    }
}

fn render(state: &SbcProgress) {
    let completed = state.completed().min(state.total_trials);
    let total = state.total_trials;
    let elapsed = state.start_time.elapsed().as_secs_f64();

    let pct = if total > 0 { completed * 100 / total } else { 0 };
    let speed = if elapsed > 0.05 { completed as f64 / elapsed } else { 0.0 };
    let remaining = if speed > 0.0 && completed < total {
        (total - completed) as f64 / speed
    } else {
        0.0
    };

    let bar_width = 30;
    let filled = if total > 0 { bar_width * completed / total } else { 0 };
    let bar: String = "━".repeat(filled) + &"╌".repeat(bar_width - filled);

    let is_done = state.done.load(Ordering::Relaxed);
    let mut err = std::io::stderr().lock();

    if is_done {
        let _ = write!(
            err,
            "\r{} {} {:>3}% │ {}/{} trials │ {} posterior draws │ {}\x1b[K\n",
            label(state),
            bar,
            pct,
            fmt_count(completed),
            fmt_count(total),
            fmt_count(completed * state.num_posterior_samples),
            fmt_time(elapsed),
        );
    } else {
        let _ = write!(
            err,
            "\r{} {} {:>3}% │ {}/{} trials │ {} trials/s │ {} < ~{}\x1b[K",
            label(state),
            bar,
            pct,
            fmt_count(completed),
            fmt_count(total),
            fmt_speed(speed),
            fmt_time(elapsed),
            fmt_time(remaining),
        );
    }
    let _ = err.flush();
}

/// Spawn a background thread that renders the progress bar at ~10 Hz.
/// Call `state.finish()` then `handle.join()` once the run is over.
pub fn spawn_progress_thread(state: Arc<SbcProgress>) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !state.done.load(Ordering::Relaxed) {
            render(&state);
            std::thread::sleep(Duration::from_millis(100));
        }
        render(&state);
    })
}

/// Optional progress reporting: a no-op when disabled.
pub(crate) struct ProgressGuard {
    state: Arc<SbcProgress>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl ProgressGuard {
    pub(crate) fn start(state: SbcProgress, show: bool) -> Self {
        let state = Arc::new(state);
        let handle = show.then(|| spawn_progress_thread(Arc::clone(&state)));
        Self { state, handle }
    }

    pub(crate) fn state(&self) -> &SbcProgress {
        &self.state
    }
}

impl Drop for ProgressGuard {
    fn drop(&mut self) {
        self.state.finish();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let p = SbcProgress::new(10, 2, 100);
        p.increment();
        p.add(4);
        assert_eq!(p.completed(), 5);
        assert!(!p.done.load(Ordering::Relaxed));
        p.finish();
        assert!(p.done.load(Ordering::Relaxed));
    }

    #[test]
    fn test_formatting() {
        assert_eq!(fmt_count(999), "999");
        assert_eq!(fmt_count(12_345), "12.3k");
        assert_eq!(fmt_time(75.0), "1:15");
        assert_eq!(fmt_speed(2.5), "2.5");
    }

    #[test]
    fn test_guard_finishes_on_drop() {
        let guard = ProgressGuard::start(SbcProgress::new(3, 1, 10), false);
        guard.state().add(3);
        let completed = guard.state().completed();
        drop(guard);
        assert_eq!(completed, 3);
    }
}
