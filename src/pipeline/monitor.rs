//! Run counters and the completion/liveness monitor.
//!
//! Every counter only ever grows. Delayed tasks are counted as submitted
//! when they are scheduled, so `submitted == completed` can only hold once
//! no work is queued, running or waiting on a timer.

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Stats {
    submitted: AtomicU64,
    completed: AtomicU64,
    relationships_submitted: AtomicU64,
    db_submitted: AtomicU64,
    db_completed: AtomicU64,
    errors: AtomicU64,
    started: Instant,
    /// Milliseconds since `started` at the last recorded activity.
    last_activity_ms: AtomicU64,
    scan_complete: AtomicBool,
    shutdown_initiated: AtomicBool,
}

/// A point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub relationships_submitted: u64,
    pub db_submitted: u64,
    pub db_completed: u64,
    pub errors: u64,
    pub scan_complete: bool,
    pub shutdown_initiated: bool,
}

impl StatsSnapshot {
    /// Scan finished and nothing is queued, running or awaiting the DB worker.
    pub fn is_drained(&self) -> bool {
        self.scan_complete
            && self.completed >= self.submitted
            && self.db_completed >= self.db_submitted
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            relationships_submitted: AtomicU64::new(0),
            db_submitted: AtomicU64::new(0),
            db_completed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            scan_complete: AtomicBool::new(false),
            shutdown_initiated: AtomicBool::new(false),
        }
    }

    pub fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn record_relationship(&self) {
        self.relationships_submitted.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_db_submitted(&self) {
        self.db_submitted.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn record_db_completed(&self) {
        self.db_completed.fetch_add(1, Ordering::SeqCst);
        self.touch();
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn touch(&self) {
        let now = self.started.elapsed().as_millis() as u64;
        self.last_activity_ms.fetch_max(now, Ordering::SeqCst);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity_ms.load(Ordering::SeqCst)))
    }

    pub fn mark_scan_complete(&self) {
        self.scan_complete.store(true, Ordering::SeqCst);
        self.touch();
    }

    pub fn is_scan_complete(&self) -> bool {
        self.scan_complete.load(Ordering::SeqCst)
    }

    pub fn is_shutdown_initiated(&self) -> bool {
        self.shutdown_initiated.load(Ordering::SeqCst)
    }

    /// Flip `shutdown_initiated`; only the first caller gets `true`.
    pub fn initiate_shutdown(&self) -> bool {
        self.shutdown_initiated
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        // Completions are loaded before submissions so work scheduled in
        // between can never make the run look drained.
        let completed = self.completed.load(Ordering::SeqCst);
        let db_completed = self.db_completed.load(Ordering::SeqCst);
        StatsSnapshot {
            submitted: self.submitted.load(Ordering::SeqCst),
            completed,
            relationships_submitted: self.relationships_submitted.load(Ordering::SeqCst),
            db_submitted: self.db_submitted.load(Ordering::SeqCst),
            db_completed,
            errors: self.errors.load(Ordering::SeqCst),
            scan_complete: self.scan_complete.load(Ordering::SeqCst),
            shutdown_initiated: self.shutdown_initiated.load(Ordering::SeqCst),
        }
    }
}

/// Why the monitor declared the run finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DoneReason {
    /// All submitted work and DB requests completed.
    Drained,
    /// Scan finished but nothing happened for the inactivity timeout.
    Stalled,
}

/// Decide whether the run is over.
pub fn evaluate(
    snapshot: &StatsSnapshot,
    idle: Duration,
    inactivity_timeout: Duration,
) -> Option<DoneReason> {
    if snapshot.is_drained() {
        Some(DoneReason::Drained)
    } else if snapshot.scan_complete && idle > inactivity_timeout {
        Some(DoneReason::Stalled)
    } else {
        None
    }
}

/// Check the counters every `tick` and publish a [`DoneReason`] exactly once.
pub async fn run_monitor(
    stats: std::sync::Arc<Stats>,
    tick: Duration,
    inactivity_timeout: Duration,
    done: watch::Sender<Option<DoneReason>>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("monitor cancelled");
                return;
            }
            _ = interval.tick() => {}
        }

        let snapshot = stats.snapshot();
        let Some(reason) = evaluate(&snapshot, stats.idle_for(), inactivity_timeout) else {
            continue;
        };
        if !stats.initiate_shutdown() {
            return;
        }

        match reason {
            DoneReason::Drained => info!(
                submitted = snapshot.submitted,
                completed = snapshot.completed,
                db_requests = snapshot.db_completed,
                "all work completed"
            ),
            DoneReason::Stalled => warn!(
                submitted = snapshot.submitted,
                completed = snapshot.completed,
                db_submitted = snapshot.db_submitted,
                db_completed = snapshot.db_completed,
                idle_ms = stats.idle_for().as_millis() as u64,
                "no progress before the inactivity timeout; finishing early"
            ),
        }
        let _ = done.send(Some(reason));
        return;
    }
}

/// Log the counters every `every` until cancelled.
pub async fn run_status_logger(
    stats: std::sync::Arc<Stats>,
    every: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // First tick fires immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                let s = stats.snapshot();
                info!(
                    submitted = s.submitted,
                    completed = s.completed,
                    relationships = s.relationships_submitted,
                    db_submitted = s.db_submitted,
                    db_completed = s.db_completed,
                    errors = s.errors,
                    scan_complete = s.scan_complete,
                    "pipeline status"
                );
            }
        }
    }
}
