//! Storage abstraction for vault-sync.
//!
//! The [`EntityStore`] trait defines every persistence operation the
//! pipeline needs: entity upsert and lookup by slug, the fingerprint cache
//! table, and association rows. Backends are pluggable:
//!
//! - [`SqliteStore`](sqlite::SqliteStore): the production backend.
//! - [`InMemoryStore`](memory::InMemoryStore): for tests.
//!
//! Only the database worker calls the mutating methods during a run.
//! Implementations must be `Send + Sync` to be shared behind an `Arc`.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::models::{Association, Entity, EntityKind, FingerprintEntry};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Row counts reported by `vsync status`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub posts: u64,
    pub projects: u64,
    pub tags: u64,
    pub associations: u64,
    pub fingerprints: u64,
}

impl StoreCounts {
    pub fn entities(&self) -> u64 {
        self.posts + self.projects + self.tags
    }
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`upsert_entity`](EntityStore::upsert_entity) | Insert or overwrite by `(kind, slug)`; returns the entity with its id |
/// | [`find_by_slug`](EntityStore::find_by_slug) | Lookup by `(kind, slug)` |
/// | [`load_fingerprints`](EntityStore::load_fingerprints) | Read the whole cache table |
/// | [`upsert_fingerprints`](EntityStore::upsert_fingerprints) | Write a batch of cache rows |
/// | [`clear_fingerprints`](EntityStore::clear_fingerprints) | Forget every cached fingerprint |
/// | [`insert_association`](EntityStore::insert_association) | Insert-or-ignore a join row |
/// | [`counts`](EntityStore::counts) | Row counts for reporting |
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Insert or update an entity. All mutable columns are overwritten and
    /// the id of an existing row is preserved.
    async fn upsert_entity(&self, entity: &Entity) -> Result<Entity>;

    async fn find_by_slug(&self, kind: EntityKind, slug: &str) -> Result<Option<Entity>>;

    async fn load_fingerprints(&self) -> Result<Vec<FingerprintEntry>>;

    async fn upsert_fingerprints(&self, entries: &[FingerprintEntry]) -> Result<()>;

    /// Returns the number of rows removed.
    async fn clear_fingerprints(&self) -> Result<u64>;

    /// Returns `true` if a new row was written, `false` if it already existed.
    async fn insert_association(&self, association: &Association) -> Result<bool>;

    async fn counts(&self) -> Result<StoreCounts>;
}
