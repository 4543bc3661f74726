//! Worker pool: N tasks sharing one receiver, each running tasks to
//! completion one at a time.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::db_worker::DbHandle;
use super::monitor::Stats;
use super::queue::{ErrorSink, TaskQueue};
use super::task::{RelationshipRequest, Task, TaskKind};
use crate::cache::PathCache;
use crate::config::PipelineConfig;
use crate::content;
use crate::embedding::{project_to_3d, Embedder};
use crate::error::{PipelineError, PipelineResult};
use crate::hash::fingerprint;
use crate::markdown::MarkdownParser;
use crate::models::Entity;
use crate::object_store::ObjectStore;

/// When a failed relationship task gets another attempt.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_not_found: bool,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            retry_not_found: config.retry_not_found,
            backoff: config.retry_backoff(),
        }
    }

    pub fn is_retryable(&self, err: &PipelineError) -> bool {
        err.is_transient() || (self.retry_not_found && err.is_not_found())
    }

    /// Delay before attempt `retry_count + 1`, or `None` to give up.
    pub fn next_delay(&self, err: &PipelineError, retry_count: u32) -> Option<Duration> {
        if retry_count >= self.max_retries || !self.is_retryable(err) {
            return None;
        }
        Some(self.backoff * (retry_count + 1))
    }
}

/// Everything a worker needs, shared by the whole pool.
pub struct WorkerContext {
    pub content_root: PathBuf,
    pub queue: TaskQueue,
    pub db: DbHandle,
    pub path_cache: Arc<PathCache>,
    pub objects: Arc<dyn ObjectStore>,
    pub embedder: Arc<dyn Embedder>,
    pub markdown: Arc<dyn MarkdownParser>,
    pub errors: ErrorSink,
    pub stats: Arc<Stats>,
    pub retry: RetryPolicy,
    pub relationship_delay: Duration,
}

pub async fn worker_loop(
    worker_id: usize,
    rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    ctx: Arc<WorkerContext>,
    cancel: CancellationToken,
) {
    trace!(worker_id, "worker starting");
    let mut processed = 0u64;

    loop {
        let task = {
            let mut rx_guard = rx.lock().await;
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                task = rx_guard.recv() => task,
            }
        };

        match task {
            Some(task) => {
                ctx.process(task).await;
                processed += 1;
            }
            None => break,
        }
    }

    trace!(worker_id, processed, "worker finished");
}

impl WorkerContext {
    /// Run one task and account for it. Follow-up work is scheduled before
    /// the task is marked completed.
    pub async fn process(&self, task: Task) {
        trace!(path = %task.path, kind = task.label(), retry = task.retry_count, "processing");
        let result = match task.kind {
            TaskKind::Asset => self.process_asset(&task).await,
            TaskKind::Document => self.process_document(&task).await,
            TaskKind::Relationship(ref request) => self.process_relationship(&task, request).await,
        };
        if let Err(e) = result {
            self.errors.report(e).await;
        }
        self.stats.record_completed();
    }

    async fn load(&self, task: &Task) -> PipelineResult<Vec<u8>> {
        if let Some(ref bytes) = task.content {
            return Ok(bytes.clone());
        }
        tokio::fs::read(self.content_root.join(&task.path))
            .await
            .map_err(|source| PipelineError::Read {
                path: task.path.clone(),
                source,
            })
    }

    /// Whether `path` is unchanged since the last successful run.
    async fn is_unchanged(&self, path: &str, fp: &str) -> bool {
        if !self.path_cache.is_loaded() {
            if let Err(e) = self.db.load_all_fingerprints().await {
                warn!(error = %e, "path cache reload failed");
            }
        }
        self.path_cache.matches(path, fp)
    }

    async fn process_asset(&self, task: &Task) -> PipelineResult<()> {
        let bytes = self.load(task).await?;
        let fp = fingerprint(&bytes);
        if self.is_unchanged(&task.path, &fp).await {
            trace!(path = %task.path, "asset unchanged");
            return Ok(());
        }

        let content_type = content::content_type(&task.path);
        if content::is_video(content_type) {
            debug!(path = %task.path, content_type, "video asset; not uploading");
        } else {
            self.objects
                .put(&task.path, &bytes, content_type)
                .await
                .map_err(|source| PipelineError::Upload {
                    path: task.path.clone(),
                    source,
                })?;
            debug!(path = %task.path, bytes = bytes.len(), "asset uploaded");
        }

        self.db.update_fingerprint(task.path.as_str(), fp).await
    }

    async fn process_document(&self, task: &Task) -> PipelineResult<()> {
        let kind = content::document_kind(&task.path).ok_or_else(|| PipelineError::Validation {
            path: task.path.clone(),
            problems: vec!["not under posts/, projects/ or tags/".to_string()],
        })?;

        let bytes = self.load(task).await?;
        let fp = fingerprint(&bytes);
        if self.is_unchanged(&task.path, &fp).await {
            trace!(path = %task.path, "document unchanged");
            return Ok(());
        }

        let rendered = self
            .markdown
            .convert(&bytes)
            .map_err(|e| PipelineError::Parse {
                path: task.path.clone(),
                message: format!("{:#}", e),
            })?;
        let front = content::decode_front_matter(&task.path, rendered.front_matter.as_deref())?;
        let mut entity = content::build_entity(kind, &task.path, &fp, rendered.html, front);
        content::validate(&task.path, &entity)?;

        self.enrich(&task.path, &bytes, &mut entity).await;

        let saved = self.db.save_entity(entity).await?;
        let request = RelationshipRequest::for_entity(&saved);
        self.queue.schedule(
            Task::relationship(task.path.as_str(), request),
            self.relationship_delay,
        )?;

        self.db.update_fingerprint(task.path.as_str(), fp).await
    }

    /// Attach 3-D coordinates. Failures are logged and the entity is kept.
    async fn enrich(&self, path: &str, source: &[u8], entity: &mut Entity) {
        if !self.embedder.is_enabled() {
            return;
        }
        let text = String::from_utf8_lossy(source);
        match self.embedder.embed(&text).await {
            Ok(vector) => {
                let (x, y, z) = project_to_3d(&vector);
                entity.x = x;
                entity.y = y;
                entity.z = z;
            }
            Err(source) => {
                let err = PipelineError::Embedding {
                    path: path.to_string(),
                    source,
                };
                warn!(error = %err, "storing document without coordinates");
            }
        }
    }

    async fn process_relationship(
        &self,
        task: &Task,
        request: &RelationshipRequest,
    ) -> PipelineResult<()> {
        let err = match self.db.update_relationships(request.clone()).await {
            Ok(outcome) => {
                trace!(
                    path = %task.path,
                    inserted = outcome.inserted,
                    existing = outcome.existing,
                    "relationships resolved"
                );
                return Ok(());
            }
            Err(e) => e,
        };

        match self.retry.next_delay(&err, task.retry_count) {
            Some(delay) => {
                debug!(
                    path = %task.path,
                    retry = task.retry_count + 1,
                    ?delay,
                    error = %err,
                    "relationship resolution failed; retrying"
                );
                self.queue.schedule(task.retried(), delay)
            }
            None if task.retry_count > 0 => Err(PipelineError::RetriesExhausted {
                path: task.path.clone(),
                attempts: task.retry_count + 1,
                source: Box::new(err),
            }),
            None => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EntityKind;

    fn policy(retry_not_found: bool) -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            retry_not_found,
            backoff: Duration::from_millis(250),
        }
    }

    fn not_found() -> PipelineError {
        PipelineError::NotFound {
            kind: EntityKind::Tag,
            slug: "b".into(),
            origin: "a".into(),
        }
    }

    #[test]
    fn backoff_grows_linearly_up_to_the_cap() {
        let p = policy(true);
        let err = not_found();
        assert_eq!(p.next_delay(&err, 0), Some(Duration::from_millis(250)));
        assert_eq!(p.next_delay(&err, 1), Some(Duration::from_millis(500)));
        assert_eq!(p.next_delay(&err, 2), Some(Duration::from_millis(750)));
        assert_eq!(p.next_delay(&err, 3), None);
    }

    #[test]
    fn not_found_fails_fast_when_disabled() {
        assert_eq!(policy(false).next_delay(&not_found(), 0), None);
    }

    #[test]
    fn timeouts_retry_regardless_of_not_found_policy() {
        let err = PipelineError::timeout("find tag b", Duration::from_secs(3));
        assert!(policy(false).next_delay(&err, 0).is_some());
    }

    #[test]
    fn permanent_errors_never_retry() {
        let err = PipelineError::Parse {
            path: "posts/a.md".into(),
            message: "bad".into(),
        };
        assert_eq!(policy(true).next_delay(&err, 0), None);
    }
}
