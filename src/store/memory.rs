//! In-memory [`EntityStore`] implementation for tests.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`. Ids are assigned per kind
//! starting at 1, mirroring SQLite's autoincrement. A write counter lets
//! tests assert that an unchanged run touched nothing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Association, Entity, EntityKind, FingerprintEntry};

use super::{EntityStore, StoreCounts};

#[derive(Default)]
pub struct InMemoryStore {
    entities: RwLock<HashMap<(EntityKind, String), Entity>>,
    next_ids: RwLock<HashMap<EntityKind, i64>>,
    fingerprints: RwLock<HashMap<String, String>>,
    associations: RwLock<HashSet<(&'static str, i64, i64)>>,
    entity_writes: AtomicU64,
    fingerprint_writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `upsert_entity` calls served.
    pub fn entity_writes(&self) -> u64 {
        self.entity_writes.load(Ordering::SeqCst)
    }

    /// Number of fingerprint rows written, counting rewrites.
    pub fn fingerprint_writes(&self) -> u64 {
        self.fingerprint_writes.load(Ordering::SeqCst)
    }

    /// Rows of one join table as `(left, right)` pairs, sorted.
    pub fn association_rows(&self, table: &str) -> Vec<(i64, i64)> {
        let mut rows: Vec<(i64, i64)> = self
            .associations
            .read()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| *t == table)
            .map(|(_, l, r)| (*l, *r))
            .collect();
        rows.sort_unstable();
        rows
    }

    pub fn fingerprint(&self, path: &str) -> Option<String> {
        self.fingerprints.read().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn upsert_entity(&self, entity: &Entity) -> Result<Entity> {
        self.entity_writes.fetch_add(1, Ordering::SeqCst);
        let key = (entity.kind, entity.slug.clone());
        let mut entities = self.entities.write().unwrap();
        let id = match entities.get(&key) {
            Some(existing) => existing.id,
            None => {
                let mut ids = self.next_ids.write().unwrap();
                let next = ids.entry(entity.kind).or_insert(0);
                *next += 1;
                *next
            }
        };
        let mut saved = entity.clone();
        saved.id = id;
        entities.insert(key, saved.clone());
        Ok(saved)
    }

    async fn find_by_slug(&self, kind: EntityKind, slug: &str) -> Result<Option<Entity>> {
        Ok(self
            .entities
            .read()
            .unwrap()
            .get(&(kind, slug.to_string()))
            .cloned())
    }

    async fn load_fingerprints(&self) -> Result<Vec<FingerprintEntry>> {
        Ok(self
            .fingerprints
            .read()
            .unwrap()
            .iter()
            .map(|(path, fp)| FingerprintEntry {
                path: path.clone(),
                fingerprint: fp.clone(),
            })
            .collect())
    }

    async fn upsert_fingerprints(&self, entries: &[FingerprintEntry]) -> Result<()> {
        let mut fps = self.fingerprints.write().unwrap();
        for e in entries {
            fps.insert(e.path.clone(), e.fingerprint.clone());
        }
        self.fingerprint_writes
            .fetch_add(entries.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn clear_fingerprints(&self) -> Result<u64> {
        let mut fps = self.fingerprints.write().unwrap();
        let n = fps.len() as u64;
        fps.clear();
        Ok(n)
    }

    async fn insert_association(&self, association: &Association) -> Result<bool> {
        let (table, left, right) = association.join();
        Ok(self
            .associations
            .write()
            .unwrap()
            .insert((table.table, left, right)))
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let entities = self.entities.read().unwrap();
        let count = |kind: EntityKind| entities.keys().filter(|(k, _)| *k == kind).count() as u64;
        Ok(StoreCounts {
            posts: count(EntityKind::Post),
            projects: count(EntityKind::Project),
            tags: count(EntityKind::Tag),
            associations: self.associations.read().unwrap().len() as u64,
            fingerprints: self.fingerprints.read().unwrap().len() as u64,
        })
    }
}
