//! Turns an entity's declared slug lists into association rows.
//!
//! Runs inside the database worker, so every store call here is already
//! serialized with all other writes.

use std::future::Future;
use std::time::Duration;

use tracing::trace;

use super::task::RelationshipRequest;
use crate::cache::EntityCache;
use crate::error::{PipelineError, PipelineResult};
use crate::models::{Association, Entity, EntityKind};
use crate::store::EntityStore;

/// What one resolution did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelationshipOutcome {
    pub inserted: usize,
    pub existing: usize,
    pub skipped_self: usize,
}

pub struct Resolver<'a> {
    store: &'a dyn EntityStore,
    cache: &'a EntityCache,
    store_timeout: Duration,
}

impl<'a> Resolver<'a> {
    pub fn new(store: &'a dyn EntityStore, cache: &'a EntityCache, store_timeout: Duration) -> Self {
        Self {
            store,
            cache,
            store_timeout,
        }
    }

    /// Cache first, then the store. Hits from the store are cached.
    pub async fn find(&self, kind: EntityKind, slug: &str, origin: &str) -> PipelineResult<Entity> {
        if let Some(entity) = self.cache.get(kind, slug) {
            return Ok(entity);
        }

        let found = bounded(
            format!("find {} {}", kind, slug),
            self.store_timeout,
            self.store.find_by_slug(kind, slug),
        )
        .await?;

        match found {
            Some(entity) => {
                self.cache.set(&entity);
                Ok(entity)
            }
            None => Err(PipelineError::NotFound {
                kind,
                slug: slug.to_string(),
                origin: origin.to_string(),
            }),
        }
    }

    /// Resolve every declared reference. The first failure aborts and is
    /// returned; associations inserted before it stay, and re-running is
    /// harmless because inserts are insert-or-ignore.
    pub async fn resolve(&self, request: &RelationshipRequest) -> PipelineResult<RelationshipOutcome> {
        let mut outcome = RelationshipOutcome::default();

        for (kind, slugs) in request.declared() {
            for slug in slugs {
                if kind == request.entity.kind && *slug == request.slug {
                    outcome.skipped_self += 1;
                    continue;
                }

                let target = self.find(kind, slug, &request.slug).await?;
                let association = Association::new(request.entity, target.entity_ref());
                let inserted = bounded(
                    format!("link {} -> {} {}", request.slug, kind, slug),
                    self.store_timeout,
                    self.store.insert_association(&association),
                )
                .await?;

                if inserted {
                    outcome.inserted += 1;
                } else {
                    outcome.existing += 1;
                }
                trace!(from = %request.slug, to = %slug, %kind, inserted, "association");
            }
        }

        Ok(outcome)
    }
}

/// Run a store call under `limit`, classifying the failure.
pub(crate) async fn bounded<T, F>(operation: String, limit: Duration, fut: F) -> PipelineResult<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(PipelineError::store(operation, e)),
        Err(_) => Err(PipelineError::timeout(operation, limit)),
    }
}
