//! Bounded task queue, the delayed-resubmission scheduler, and the error
//! stream.
//!
//! Every submission is counted in [`Stats`] before it is handed off. If the
//! hand-off fails the submission is immediately counted as completed, so the
//! counters stay balanced.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;
use tracing::{debug, error, trace, warn};

use super::monitor::Stats;
use super::task::{Task, TaskKind};
use crate::error::{PipelineError, PipelineResult};

/// Producer side of the worker queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::Sender<Task>,
    delayed: mpsc::UnboundedSender<(Task, Duration)>,
    stats: Arc<Stats>,
    submit_timeout: Duration,
}

impl TaskQueue {
    pub fn new(
        tx: mpsc::Sender<Task>,
        delayed: mpsc::UnboundedSender<(Task, Duration)>,
        stats: Arc<Stats>,
        submit_timeout: Duration,
    ) -> Self {
        Self {
            tx,
            delayed,
            stats,
            submit_timeout,
        }
    }

    /// Enqueue now, waiting at most the submit timeout for capacity.
    pub async fn submit(&self, task: Task) -> PipelineResult<()> {
        self.count(&task);
        let path = task.path.clone();
        match self.tx.send_timeout(task, self.submit_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                self.stats.record_completed();
                Err(PipelineError::SubmissionTimeout { path })
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.stats.record_completed();
                Err(PipelineError::Closed)
            }
        }
    }

    /// Enqueue once `delay` has passed. The task counts as submitted now.
    pub fn schedule(&self, task: Task, delay: Duration) -> PipelineResult<()> {
        self.count(&task);
        trace!(path = %task.path, kind = task.label(), retry = task.retry_count, ?delay, "scheduled");
        self.delayed.send((task, delay)).map_err(|_| {
            self.stats.record_completed();
            PipelineError::Closed
        })
    }

    fn count(&self, task: &Task) {
        if matches!(task.kind, TaskKind::Relationship(_)) {
            self.stats.record_relationship();
        }
        self.stats.record_submitted();
    }
}

/// Owns the timer wheel for delayed tasks and feeds expired ones into the
/// worker queue. Tasks still waiting at cancellation are dropped.
pub async fn run_scheduler(
    mut incoming: mpsc::UnboundedReceiver<(Task, Duration)>,
    tx: mpsc::Sender<Task>,
    stats: Arc<Stats>,
    cancel: CancellationToken,
) {
    let mut pending: DelayQueue<Task> = DelayQueue::new();
    let mut open = true;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(pending = pending.len(), "scheduler cancelled");
                return;
            }
            msg = incoming.recv(), if open => match msg {
                Some((task, delay)) => {
                    pending.insert(task, delay);
                }
                None => open = false,
            },
            Some(expired) = std::future::poll_fn(|cx| pending.poll_expired(cx)), if !pending.is_empty() => {
                let task = expired.into_inner();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    sent = tx.send(task) => {
                        if sent.is_err() {
                            // Counted at scheduling time; balance it.
                            stats.record_completed();
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Sending side of the terminal-error stream. Cheap to clone.
#[derive(Clone)]
pub struct ErrorSink {
    tx: mpsc::Sender<PipelineError>,
    stats: Arc<Stats>,
    timeout: Duration,
}

impl ErrorSink {
    pub fn new(tx: mpsc::Sender<PipelineError>, stats: Arc<Stats>, timeout: Duration) -> Self {
        Self { tx, stats, timeout }
    }

    /// Publish a terminal error. Blocks up to the timeout if the stream is
    /// full, then logs and drops the error.
    pub async fn report(&self, err: PipelineError) {
        self.stats.record_error();
        warn!(error = %err, "task failed");
        if let Err(e) = self.tx.send_timeout(err, self.timeout).await {
            let dropped = match e {
                mpsc::error::SendTimeoutError::Timeout(err) => err,
                mpsc::error::SendTimeoutError::Closed(err) => err,
            };
            error!(error = %dropped, "error stream unavailable; dropping error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn queue(capacity: usize) -> (TaskQueue, mpsc::Receiver<Task>, mpsc::UnboundedReceiver<(Task, Duration)>, Arc<Stats>) {
        let (tx, rx) = mpsc::channel(capacity);
        let (dtx, drx) = mpsc::unbounded_channel();
        let stats = Arc::new(Stats::new());
        let q = TaskQueue::new(tx, dtx, stats.clone(), Duration::from_millis(50));
        (q, rx, drx, stats)
    }

    #[tokio::test]
    async fn submit_times_out_when_full_and_stays_balanced() {
        let (q, _rx, _drx, stats) = queue(1);
        q.submit(Task::asset("a.png")).await.unwrap();

        let err = q.submit(Task::asset("b.png")).await.unwrap_err();
        assert!(matches!(err, PipelineError::SubmissionTimeout { ref path } if path == "b.png"));

        let s = stats.snapshot();
        assert_eq!((s.submitted, s.completed), (2, 1));
    }

    #[tokio::test]
    async fn scheduler_releases_after_delay() {
        let (q, mut rx, drx, stats) = queue(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_scheduler(drx, q.tx.clone(), stats.clone(), cancel.clone()));

        let start = Instant::now();
        q.schedule(Task::asset("late.png"), Duration::from_millis(80)).unwrap();
        assert_eq!(stats.snapshot().submitted, 1);

        let task = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.path, "late.png");
        assert!(start.elapsed() >= Duration::from_millis(70));

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn scheduler_orders_by_deadline() {
        let (q, mut rx, drx, stats) = queue(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_scheduler(drx, q.tx.clone(), stats, cancel.clone()));

        q.schedule(Task::asset("slow"), Duration::from_millis(120)).unwrap();
        q.schedule(Task::asset("fast"), Duration::from_millis(10)).unwrap();

        assert_eq!(rx.recv().await.unwrap().path, "fast");
        assert_eq!(rx.recv().await.unwrap().path, "slow");
        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn error_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let stats = Arc::new(Stats::new());
        let sink = ErrorSink::new(tx, stats.clone(), Duration::from_millis(20));
        sink.report(PipelineError::Closed).await;
        sink.report(PipelineError::Closed).await;

        assert_eq!(stats.snapshot().errors, 2);
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err());
    }
}
