//! Progress counters and shutdown coordination (spec §4.I, §9).
//!
//! Per spec §9's design note, the interrupt count is not a process-wide
//! atomic singleton; it's owned here by a [`ShutdownController`] the
//! orchestrator creates once per run and passes by reference into workers,
//! so tests can drive shutdown deterministically instead of relying on a
//! real `SIGINT`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::store::ProgressCounters;

/// Atomically-updated counters a worker pool mutates concurrently; cheap to
/// read for a periodic flush into `_crawl_progress_{target}`.
#[derive(Default)]
pub struct Counters {
    pub total_discovered: AtomicU64,
    pub processed: AtomicU64,
    pub succeeded: AtomicU64,
    pub failed: AtomicU64,
    pub skipped: AtomicU64,
    pub in_flight: AtomicU64,
    pub queue_depth: AtomicU64,
}

impl Counters {
    pub fn snapshot(&self) -> ProgressCounters {
        ProgressCounters {
            total_discovered: self.total_discovered.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Relaxed),
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
        }
    }

    pub fn incr_discovered(&self, n: u64) {
        self.total_discovered.fetch_add(n, Ordering::Relaxed);
    }
    pub fn incr_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_succeeded(&self) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }
    pub fn incr_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }
    pub fn set_in_flight(&self, n: u64) {
        self.in_flight.store(n, Ordering::Relaxed);
    }
    pub fn set_queue_depth(&self, n: u64) {
        self.queue_depth.store(n, Ordering::Relaxed);
    }
}

/// Encapsulates the single-/double-interrupt shutdown rule (spec §4.I): a
/// single interrupt requests a graceful drain; a second within 3 seconds
/// requests an immediate abort.
#[derive(Clone)]
pub struct ShutdownController {
    drain: CancellationToken,
    abort: CancellationToken,
    last_interrupt: Arc<std::sync::Mutex<Option<std::time::Instant>>>,
}

impl ShutdownController {
    pub fn new() -> Self {
        Self {
            drain: CancellationToken::new(),
            abort: CancellationToken::new(),
            last_interrupt: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    /// Call once per received interrupt signal (or directly, in tests).
    /// Returns `true` if this call triggered an immediate abort.
    pub fn signal_interrupt(&self) -> bool {
        let mut last = self.last_interrupt.lock().unwrap_or_else(|e| e.into_inner());
        let now = std::time::Instant::now();
        let double = matches!(*last, Some(prev) if now.duration_since(prev) <= std::time::Duration::from_secs(3));
        *last = Some(now);
        if self.drain.is_cancelled() && double {
            self.abort.cancel();
            true
        } else {
            self.drain.cancel();
            false
        }
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_cancelled()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn drain_token(&self) -> CancellationToken {
        self.drain.clone()
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Spawns the `ctrl_c` listener task; dropped (and the task with it)
    /// when the returned `JoinHandle` is.
    pub fn install_signal_handler(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                if this.signal_interrupt() {
                    return;
                }
            }
        })
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_interrupt_requests_drain_only() {
        let ctl = ShutdownController::new();
        let aborted = ctl.signal_interrupt();
        assert!(!aborted);
        assert!(ctl.is_draining());
        assert!(!ctl.is_aborted());
    }

    #[test]
    fn second_interrupt_within_window_aborts() {
        let ctl = ShutdownController::new();
        ctl.signal_interrupt();
        let aborted = ctl.signal_interrupt();
        assert!(aborted);
        assert!(ctl.is_aborted());
    }

    #[test]
    fn counters_snapshot_reflects_updates() {
        let counters = Counters::default();
        counters.incr_processed();
        counters.incr_succeeded();
        counters.incr_discovered(5);
        let snap = counters.snapshot();
        assert_eq!(snap.processed, 1);
        assert_eq!(snap.succeeded, 1);
        assert_eq!(snap.total_discovered, 5);
    }
}
