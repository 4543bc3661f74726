//! In-memory caches that short-circuit store round-trips.
//!
//! Both caches sit behind their own `std::sync::RwLock` and hold the lock for
//! exactly one map operation. They are advisory: a miss always falls through
//! to the store. Values are cloned in and out so readers never share a value
//! with a writer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::models::{Entity, EntityKind, FingerprintEntry};

/// `path → fingerprint` mirror of the store's cache table.
#[derive(Default)]
pub struct PathCache {
    paths: RwLock<HashMap<String, String>>,
    loaded: AtomicBool,
}

impl PathCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.paths
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn set(&self, path: impl Into<String>, fingerprint: impl Into<String>) {
        self.paths
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(path.into(), fingerprint.into());
    }

    /// Whether `path` is cached with exactly `fingerprint`.
    pub fn matches(&self, path: &str, fingerprint: &str) -> bool {
        self.paths
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .is_some_and(|cached| cached == fingerprint)
    }

    /// Swap in the full contents of the store's cache table.
    pub fn replace_all(&self, entries: Vec<FingerprintEntry>) {
        let map: HashMap<String, String> = entries
            .into_iter()
            .map(|e| (e.path, e.fingerprint))
            .collect();
        *self.paths.write().unwrap_or_else(|e| e.into_inner()) = map;
        self.loaded.store(true, Ordering::Release);
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.paths.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `(kind, slug) → entity` cache populated by saves and lookups.
#[derive(Default)]
pub struct EntityCache {
    entities: RwLock<HashMap<(EntityKind, String), Entity>>,
}

impl EntityCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: EntityKind, slug: &str) -> Option<Entity> {
        self.entities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(kind, slug.to_string()))
            .cloned()
    }

    pub fn set(&self, entity: &Entity) {
        self.entities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert((entity.kind, entity.slug.clone()), entity.clone());
    }

    pub fn len(&self) -> usize {
        self.entities.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
