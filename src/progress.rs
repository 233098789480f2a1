//! Progress reporting and cancellation.
//!
//! The forest never prints through a global: callers inject a
//! [`ProgressSink`] and an optional interrupt probe via [`Monitor`]. Workers
//! tick a shared [`ProgressLatch`] after each completed unit of work; the
//! coordinating thread waits on its condition variable, polls the interrupt
//! probe, and every [`Monitor::status_interval`] prints a status line with
//! the estimated remaining time.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Destination for progress lines.
pub trait ProgressSink: Sync {
    fn print(&self, message: &str);
}

/// Discards all progress output.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn print(&self, _message: &str) {}
}

/// Writes progress lines to standard error.
pub struct StderrSink;

impl ProgressSink for StderrSink {
    fn print(&self, message: &str) {
        eprintln!("{message}");
    }
}

static NULL_SINK: NullSink = NullSink;
static STDERR_SINK: StderrSink = StderrSink;

/// Default cadence of status lines.
pub const STATUS_INTERVAL: Duration = Duration::from_secs(30);

/// How often the coordinator wakes to poll the interrupt probe even when no
/// worker has reported progress.
const WAKE_INTERVAL: Duration = Duration::from_millis(100);

/// Injected observability for a plant or predict call.
pub struct Monitor<'a> {
    pub sink: &'a dyn ProgressSink,
    pub interrupt: Option<&'a (dyn Fn() -> bool + Sync)>,
    pub status_interval: Duration,
}

impl<'a> Monitor<'a> {
    /// No output, no interrupt probe.
    pub fn silent() -> Monitor<'static> {
        Monitor {
            sink: &NULL_SINK,
            interrupt: None,
            status_interval: STATUS_INTERVAL,
        }
    }

    /// Stderr output when `verbose`, otherwise silent.
    pub fn verbose(verbose: bool) -> Monitor<'static> {
        Monitor {
            sink: if verbose { &STDERR_SINK } else { &NULL_SINK },
            interrupt: None,
            status_interval: STATUS_INTERVAL,
        }
    }

    /// Replace the interrupt probe.
    pub fn with_interrupt<'b>(self, probe: &'b (dyn Fn() -> bool + Sync)) -> Monitor<'b>
    where
        'a: 'b,
    {
        Monitor {
            sink: self.sink,
            interrupt: Some(probe),
            status_interval: self.status_interval,
        }
    }
}

struct LatchState {
    events: usize,
    workers_done: usize,
    interrupted: bool,
}

/// Shared coordination point between interval workers and the progress loop.
pub struct ProgressLatch {
    state: Mutex<LatchState>,
    signal: Condvar,
}

impl ProgressLatch {
    pub fn new() -> Self {
        ProgressLatch {
            state: Mutex::new(LatchState {
                events: 0,
                workers_done: 0,
                interrupted: false,
            }),
            signal: Condvar::new(),
        }
    }

    /// A worker completed one unit of work.
    pub fn notify_event(&self) {
        let mut state = self.state.lock().expect("progress latch poisoned");
        state.events += 1;
        drop(state);
        self.signal.notify_all();
    }

    /// A worker finished its interval (normally or on error).
    pub fn notify_worker_done(&self) {
        let mut state = self.state.lock().expect("progress latch poisoned");
        state.workers_done += 1;
        drop(state);
        self.signal.notify_all();
    }

    pub fn is_interrupted(&self) -> bool {
        self.state.lock().expect("progress latch poisoned").interrupted
    }

    /// Run the progress loop until all events are reported, all workers are
    /// done, or an interrupt is observed. Returns true when interrupted.
    pub fn watch(
        &self,
        operation: &str,
        max_events: usize,
        n_workers: usize,
        monitor: &Monitor,
    ) -> bool {
        let t_start = Instant::now();
        let mut t_last = Instant::now();
        let mut state = self.state.lock().expect("progress latch poisoned");

        while state.events < max_events && state.workers_done < n_workers && !state.interrupted {
            let (next, _) = self
                .signal
                .wait_timeout(state, WAKE_INTERVAL.min(monitor.status_interval))
                .expect("progress latch poisoned");
            state = next;

            if let Some(probe) = monitor.interrupt {
                if probe() {
                    state.interrupted = true;
                    break;
                }
            }

            if state.events > 0 && t_last.elapsed() >= monitor.status_interval {
                let proportion = state.events as f64 / max_events as f64;
                let remain = t_start.elapsed().mul_f64((1.0 / proportion - 1.0).max(0.0));
                monitor.sink.print(&format!(
                    "{operation} progress: {:.0}%. Estimated remaining time: {}.",
                    100.0 * proportion,
                    format_hms(remain)
                ));
                t_last = Instant::now();
            }
        }
        state.interrupted
    }
}

impl Default for ProgressLatch {
    fn default() -> Self {
        Self::new()
    }
}

fn format_hms(duration: Duration) -> String {
    let total = duration.as_secs();
    format!("{:02}:{:02}:{:02}", total / 3600, (total / 60) % 60, total % 60)
}
