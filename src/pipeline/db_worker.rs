//! The database serialization worker.
//!
//! One task owns the [`EntityStore`] for the whole run and services
//! [`DbRequest`]s strictly in arrival order, so no two writes ever race.
//! Callers talk to it through a [`DbHandle`]: each request carries a
//! one-shot reply channel, and the caller gives up after the DB timeout.
//!
//! Fingerprint updates are applied to the path cache at once but written to
//! the store in batches: when `batch_size` are pending, on every
//! `flush_interval` tick, and once more on shutdown.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::monitor::Stats;
use super::resolver::{bounded, RelationshipOutcome, Resolver};
use super::task::RelationshipRequest;
use crate::cache::{EntityCache, PathCache};
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Entity, EntityKind, FingerprintEntry};
use crate::store::EntityStore;

type Reply<T> = oneshot::Sender<PipelineResult<T>>;

pub enum DbRequest {
    SaveEntity {
        entity: Box<Entity>,
        reply: Reply<Entity>,
    },
    FindBySlug {
        kind: EntityKind,
        slug: String,
        origin: String,
        reply: Reply<Entity>,
    },
    UpdateFingerprint {
        path: String,
        fingerprint: String,
        reply: Reply<()>,
    },
    LoadAllFingerprints {
        reply: Reply<usize>,
    },
    UpdateRelationships {
        request: RelationshipRequest,
        reply: Reply<RelationshipOutcome>,
    },
}

impl DbRequest {
    fn name(&self) -> &'static str {
        match self {
            DbRequest::SaveEntity { .. } => "save entity",
            DbRequest::FindBySlug { .. } => "find by slug",
            DbRequest::UpdateFingerprint { .. } => "update fingerprint",
            DbRequest::LoadAllFingerprints { .. } => "load fingerprints",
            DbRequest::UpdateRelationships { .. } => "update relationships",
        }
    }
}

// ============ Handle ============

/// Cheap to clone; shared by every worker.
#[derive(Clone)]
pub struct DbHandle {
    tx: mpsc::Sender<DbRequest>,
    stats: Arc<Stats>,
    timeout: Duration,
}

impl DbHandle {
    pub fn new(tx: mpsc::Sender<DbRequest>, stats: Arc<Stats>, timeout: Duration) -> Self {
        Self { tx, stats, timeout }
    }

    pub async fn save_entity(&self, entity: Entity) -> PipelineResult<Entity> {
        self.request(|reply| DbRequest::SaveEntity {
            entity: Box::new(entity),
            reply,
        })
        .await
    }

    pub async fn find_by_slug(
        &self,
        kind: EntityKind,
        slug: impl Into<String>,
        origin: impl Into<String>,
    ) -> PipelineResult<Entity> {
        self.request(|reply| DbRequest::FindBySlug {
            kind,
            slug: slug.into(),
            origin: origin.into(),
            reply,
        })
        .await
    }

    pub async fn update_fingerprint(
        &self,
        path: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> PipelineResult<()> {
        self.request(|reply| DbRequest::UpdateFingerprint {
            path: path.into(),
            fingerprint: fingerprint.into(),
            reply,
        })
        .await
    }

    pub async fn load_all_fingerprints(&self) -> PipelineResult<usize> {
        self.request(|reply| DbRequest::LoadAllFingerprints { reply })
            .await
    }

    pub async fn update_relationships(
        &self,
        request: RelationshipRequest,
    ) -> PipelineResult<RelationshipOutcome> {
        self.request(|reply| DbRequest::UpdateRelationships { request, reply })
            .await
    }

    /// Send and wait for the reply, bounded by the DB timeout. Counted as
    /// one DB request whether it succeeds, fails or times out.
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> DbRequest) -> PipelineResult<T> {
        let (reply, rx) = oneshot::channel();
        let request = build(reply);
        let name = request.name();

        self.stats.record_db_submitted();
        let result = tokio::time::timeout(self.timeout, async {
            self.tx
                .send(request)
                .await
                .map_err(|_| PipelineError::Closed)?;
            rx.await.map_err(|_| PipelineError::Closed)?
        })
        .await
        .unwrap_or_else(|_| Err(PipelineError::timeout(name, self.timeout)));
        self.stats.record_db_completed();

        result
    }
}

// ============ Worker ============

pub struct DbWorkerConfig {
    pub store_timeout: Duration,
    pub batch_size: usize,
    pub flush_interval: Duration,
}

pub struct DbWorker {
    store: Arc<dyn EntityStore>,
    rx: mpsc::Receiver<DbRequest>,
    path_cache: Arc<PathCache>,
    entity_cache: Arc<EntityCache>,
    config: DbWorkerConfig,
    pending: Vec<FingerprintEntry>,
}

impl DbWorker {
    pub fn new(
        store: Arc<dyn EntityStore>,
        rx: mpsc::Receiver<DbRequest>,
        path_cache: Arc<PathCache>,
        entity_cache: Arc<EntityCache>,
        config: DbWorkerConfig,
    ) -> Self {
        Self {
            store,
            rx,
            path_cache,
            entity_cache,
            pending: Vec::with_capacity(config.batch_size),
            config,
        }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        match self.load_fingerprints().await {
            Ok(n) => debug!(fingerprints = n, "path cache loaded"),
            Err(e) => warn!(error = %e, "failed to preload path cache"),
        }

        let mut interval = tokio::time::interval(self.config.flush_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(pending = self.pending.len(), "db worker cancelled");
                    break;
                }
                msg = self.rx.recv() => match msg {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                _ = interval.tick() => self.flush().await,
            }
        }

        self.flush().await;
        if !self.pending.is_empty() {
            error!(lost = self.pending.len(), "fingerprint updates not persisted at shutdown");
        }
        info!("db worker stopped");
    }

    async fn handle(&mut self, request: DbRequest) {
        trace!(request = request.name(), "db request");
        match request {
            DbRequest::SaveEntity { entity, reply } => {
                let result = self.save(&entity).await;
                let _ = reply.send(result);
            }
            DbRequest::FindBySlug {
                kind,
                slug,
                origin,
                reply,
            } => {
                let result = self.resolver().find(kind, &slug, &origin).await;
                let _ = reply.send(result);
            }
            DbRequest::UpdateFingerprint {
                path,
                fingerprint,
                reply,
            } => {
                self.path_cache.set(path.clone(), fingerprint.clone());
                self.pending.push(FingerprintEntry { path, fingerprint });
                if self.pending.len() >= self.config.batch_size {
                    self.flush().await;
                }
                let _ = reply.send(Ok(()));
            }
            DbRequest::LoadAllFingerprints { reply } => {
                let result = self.load_fingerprints().await;
                let _ = reply.send(result);
            }
            DbRequest::UpdateRelationships { request, reply } => {
                let result = self.resolver().resolve(&request).await;
                let _ = reply.send(result);
            }
        }
    }

    async fn save(&self, entity: &Entity) -> PipelineResult<Entity> {
        let saved = bounded(
            format!("save {} {}", entity.kind, entity.slug),
            self.config.store_timeout,
            self.store.upsert_entity(entity),
        )
        .await?;
        self.entity_cache.set(&saved);
        debug!(kind = %saved.kind, slug = %saved.slug, id = saved.id, "entity saved");
        Ok(saved)
    }

    /// Swap the path cache for the store's cache table. Fingerprints still
    /// waiting to be flushed are re-applied on top.
    async fn load_fingerprints(&self) -> PipelineResult<usize> {
        let mut entries = bounded(
            "load fingerprints".to_string(),
            self.config.store_timeout,
            self.store.load_fingerprints(),
        )
        .await?;
        entries.extend(self.pending.iter().cloned());
        let n = entries.len();
        self.path_cache.replace_all(entries);
        Ok(n)
    }

    async fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let result = bounded(
            "flush fingerprints".to_string(),
            self.config.store_timeout,
            self.store.upsert_fingerprints(&self.pending),
        )
        .await;
        match result {
            Ok(()) => {
                debug!(count = self.pending.len(), "fingerprints flushed");
                self.pending.clear();
            }
            Err(e) => warn!(error = %e, pending = self.pending.len(), "fingerprint flush failed; will retry"),
        }
    }

    fn resolver(&self) -> Resolver<'_> {
        Resolver::new(
            self.store.as_ref(),
            &self.entity_cache,
            self.config.store_timeout,
        )
    }
}
