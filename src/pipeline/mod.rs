//! The concurrent ingestion pipeline.
//!
//! ```text
//! scan_fs ──submit──▶ task queue ──▶ workers (N) ──▶ object store
//!                        ▲              │  ▲
//!                        │ scheduler    │  │ one-shot replies
//!                        └──(delayed)───┤  │
//!                                       ▼  │
//!                                  DB worker ──▶ EntityStore
//!
//! monitor: counters + idle time ──▶ done signal (once)
//! ```
//!
//! | Module | Role |
//! |--------|------|
//! | [`task`] | `Task`, `TaskKind`, `RelationshipRequest` |
//! | [`queue`] | bounded submission, delayed resubmission, error stream |
//! | [`worker`] | asset/document/relationship processing and retry policy |
//! | [`db_worker`] | the single store writer and its request protocol |
//! | [`resolver`] | slug lists → association rows |
//! | [`monitor`] | counters, completion and liveness detection |

pub mod db_worker;
pub mod monitor;
pub mod queue;
pub mod resolver;
pub mod task;
pub mod worker;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::{EntityCache, PathCache};
use crate::config::{Config, PipelineConfig};
use crate::embedding::Embedder;
use crate::error::{PipelineError, PipelineResult};
use crate::markdown::MarkdownParser;
use crate::object_store::ObjectStore;
use crate::scanner::{self, ScanOptions};
use crate::store::EntityStore;

use db_worker::{DbHandle, DbRequest, DbWorker, DbWorkerConfig};
use monitor::{DoneReason, Stats, StatsSnapshot};
use queue::{ErrorSink, TaskQueue};
use task::Task;
use worker::{RetryPolicy, WorkerContext};

/// Tasks submitted from a scan between yields.
const SCAN_BATCH: usize = 100;
/// Capacity of the DB worker's request queue.
const DB_QUEUE_CAPACITY: usize = 256;
/// Capacity of the terminal-error stream.
const ERROR_STREAM_CAPACITY: usize = 1024;

/// The external systems a pipeline talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn EntityStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub embedder: Arc<dyn Embedder>,
    pub markdown: Arc<dyn MarkdownParser>,
}

/// Receivers and the store, held until [`Pipeline::start`] spawns their owners.
struct Pending {
    task_rx: mpsc::Receiver<Task>,
    delayed_rx: mpsc::UnboundedReceiver<(Task, Duration)>,
    db_rx: mpsc::Receiver<DbRequest>,
    done_tx: watch::Sender<Option<DoneReason>>,
}

pub struct Pipeline {
    config: PipelineConfig,
    scan: ScanOptions,
    collaborators: Collaborators,
    stats: Arc<Stats>,
    path_cache: Arc<PathCache>,
    entity_cache: Arc<EntityCache>,
    queue: TaskQueue,
    task_tx: mpsc::Sender<Task>,
    db: DbHandle,
    errors: ErrorSink,
    errors_rx: StdMutex<Option<mpsc::Receiver<PipelineError>>>,
    done_rx: watch::Receiver<Option<DoneReason>>,
    pending: StdMutex<Option<Pending>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Pipeline {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let pipeline = config.pipeline.clone();
        let stats = Arc::new(Stats::new());

        let (task_tx, task_rx) = mpsc::channel(pipeline.queue_capacity);
        let (delayed_tx, delayed_rx) = mpsc::unbounded_channel();
        let (db_tx, db_rx) = mpsc::channel(DB_QUEUE_CAPACITY);
        let (errors_tx, errors_rx) = mpsc::channel(ERROR_STREAM_CAPACITY);
        let (done_tx, done_rx) = watch::channel(None);

        let queue = TaskQueue::new(
            task_tx.clone(),
            delayed_tx,
            stats.clone(),
            pipeline.submit_timeout(),
        );
        let db = DbHandle::new(db_tx, stats.clone(), pipeline.db_timeout());
        let errors = ErrorSink::new(errors_tx, stats.clone(), pipeline.submit_timeout());

        Self {
            scan: ScanOptions::from(&config.content),
            config: pipeline,
            collaborators,
            stats,
            path_cache: Arc::new(PathCache::new()),
            entity_cache: Arc::new(EntityCache::new()),
            queue,
            task_tx,
            db,
            errors,
            errors_rx: StdMutex::new(Some(errors_rx)),
            done_rx,
            pending: StdMutex::new(Some(Pending {
                task_rx,
                delayed_rx,
                db_rx,
                done_tx,
            })),
            handles: StdMutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Spawn the DB worker, scheduler, monitor, status logger and
    /// `worker_count` workers. Calling it again is a no-op.
    pub fn start(&self, worker_count: usize) {
        let Some(pending) = self.pending.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            warn!("pipeline already started");
            return;
        };
        let worker_count = worker_count.max(1);
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());

        let db_worker = DbWorker::new(
            self.collaborators.store.clone(),
            pending.db_rx,
            self.path_cache.clone(),
            self.entity_cache.clone(),
            DbWorkerConfig {
                store_timeout: self.config.store_timeout(),
                batch_size: self.config.batch_size,
                flush_interval: self.config.flush_interval(),
            },
        );
        handles.push(tokio::spawn(db_worker.run(self.cancel.clone())));

        handles.push(tokio::spawn(queue::run_scheduler(
            pending.delayed_rx,
            self.task_tx.clone(),
            self.stats.clone(),
            self.cancel.clone(),
        )));

        handles.push(tokio::spawn(monitor::run_monitor(
            self.stats.clone(),
            self.config.monitor_tick(),
            self.config.inactivity_timeout(),
            pending.done_tx,
            self.cancel.clone(),
        )));

        handles.push(tokio::spawn(monitor::run_status_logger(
            self.stats.clone(),
            self.config.status_interval(),
            self.cancel.clone(),
        )));

        let ctx = Arc::new(WorkerContext {
            content_root: self.scan.root.clone(),
            queue: self.queue.clone(),
            db: self.db.clone(),
            path_cache: self.path_cache.clone(),
            objects: self.collaborators.objects.clone(),
            embedder: self.collaborators.embedder.clone(),
            markdown: self.collaborators.markdown.clone(),
            errors: self.errors.clone(),
            stats: self.stats.clone(),
            retry: RetryPolicy::from_config(&self.config),
            relationship_delay: self.config.relationship_delay(),
        });
        let rx = Arc::new(Mutex::new(pending.task_rx));
        for worker_id in 0..worker_count {
            handles.push(tokio::spawn(worker::worker_loop(
                worker_id,
                rx.clone(),
                ctx.clone(),
                self.cancel.clone(),
            )));
        }

        info!(workers = worker_count, "pipeline started");
    }

    /// Walk the content root and submit every classified file. The scan is
    /// marked complete afterwards even if the walk failed.
    pub async fn scan_fs(&self) -> Result<()> {
        let result = self.scan_and_submit().await;
        self.stats.mark_scan_complete();
        result
    }

    async fn scan_and_submit(&self) -> Result<()> {
        let options = self.scan.clone();
        let tasks = tokio::task::spawn_blocking(move || scanner::scan(&options))
            .await
            .context("scanner task panicked")??;
        info!(files = tasks.len(), root = %self.scan.root.display(), "content tree scanned");

        let mut tasks = tasks.into_iter().peekable();
        let mut batch_no = 0usize;
        while tasks.peek().is_some() {
            for task in tasks.by_ref().take(SCAN_BATCH) {
                if let Err(PipelineError::Closed) = self.submit_task(task).await {
                    anyhow::bail!("pipeline closed during scan");
                }
            }
            batch_no += 1;
            debug!(batch = batch_no, "scan batch submitted");
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    /// Submit a single task, waiting at most the submit timeout for queue
    /// space. A timeout is also reported on the error stream.
    pub async fn submit_task(&self, task: Task) -> PipelineResult<()> {
        match self.queue.submit(task).await {
            Err(PipelineError::SubmissionTimeout { path }) => {
                self.errors
                    .report(PipelineError::SubmissionTimeout { path: path.clone() })
                    .await;
                Err(PipelineError::SubmissionTimeout { path })
            }
            other => other,
        }
    }

    /// Mark the scan complete without walking the tree, for callers that
    /// only use [`submit_task`](Self::submit_task).
    pub fn finish_submissions(&self) {
        self.stats.mark_scan_complete();
    }

    /// Wait for the monitor's done signal. `true` if it arrived in time.
    pub async fn wait_for_completion(&self, timeout: Duration) -> bool {
        let mut rx = self.done_rx.clone();
        let waited = tokio::time::timeout(timeout, rx.wait_for(|reason| reason.is_some())).await;
        matches!(waited, Ok(Ok(_)))
    }

    /// How the run ended, once the monitor has decided.
    pub fn completion(&self) -> Option<DoneReason> {
        *self.done_rx.borrow()
    }

    /// Hand out the terminal-error stream. Only the first call gets it.
    pub fn take_errors(&self) -> Option<mpsc::Receiver<PipelineError>> {
        self.errors_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Cancel every loop and wait for them to exit. The DB worker flushes
    /// pending fingerprints on the way out. Safe to call more than once.
    pub async fn close(&self) {
        self.stats.initiate_shutdown();
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.handles.lock().unwrap_or_else(|e| e.into_inner()));
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "pipeline task ended abnormally");
            }
        }
        debug!("pipeline closed");
    }
}

/// Summary of one `vsync sync`.
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub submitted: u64,
    pub completed: u64,
    pub relationships: u64,
    pub db_requests: u64,
    pub errors: Vec<String>,
    pub completed_cleanly: bool,
    pub reason: Option<DoneReason>,
    pub elapsed_ms: u64,
}

impl SyncReport {
    /// Fail with every collected error if any task failed.
    pub fn ensure_clean(&self) -> Result<()> {
        if self.errors.is_empty() {
            return Ok(());
        }
        let mut message = format!("{} file(s) failed to sync:", self.errors.len());
        for e in &self.errors {
            message.push_str("\n  - ");
            message.push_str(e);
        }
        anyhow::bail!(message)
    }
}

/// One full run: optional fingerprint reset, scan, wait, shut down, report.
pub async fn run_sync(
    config: &Config,
    collaborators: Collaborators,
    worker_count: usize,
    full: bool,
) -> Result<SyncReport> {
    let started = Instant::now();

    if full {
        let cleared = collaborators
            .store
            .clear_fingerprints()
            .await
            .context("Failed to clear fingerprint cache")?;
        info!(cleared, "full resync: fingerprint cache cleared");
    }

    let pipeline = Pipeline::new(config, collaborators);
    let mut errors_rx = pipeline
        .take_errors()
        .context("error stream already taken")?;
    let collector = tokio::spawn(async move {
        let mut errors = Vec::new();
        while let Some(e) = errors_rx.recv().await {
            errors.push(e.to_string());
        }
        errors
    });

    pipeline.start(worker_count);
    let scan_result = pipeline.scan_fs().await;

    let finished = pipeline
        .wait_for_completion(config.pipeline.completion_timeout())
        .await;
    if !finished {
        warn!(
            timeout_secs = config.pipeline.completion_timeout_secs,
            "pipeline did not finish in time; shutting down"
        );
    }
    let reason = pipeline.completion();
    pipeline.close().await;
    let stats = pipeline.stats();
    drop(pipeline);

    let mut errors = collector.await.context("error collector panicked")?;
    if let Err(e) = scan_result {
        errors.push(format!("scan failed: {:#}", e));
    }

    Ok(SyncReport {
        submitted: stats.submitted,
        completed: stats.completed,
        relationships: stats.relationships_submitted,
        db_requests: stats.db_completed,
        completed_cleanly: reason == Some(DoneReason::Drained) && errors.is_empty(),
        errors,
        reason,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}
