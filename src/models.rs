//! Core data models used throughout vault-sync.
//!
//! These types represent the entities, associations, and fingerprint rows
//! that flow through the ingestion pipeline and into the store.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The three kinds of document-backed entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Post,
    Project,
    Tag,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Post, EntityKind::Project, EntityKind::Tag];

    /// Table holding rows of this kind.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Post => "posts",
            EntityKind::Project => "projects",
            EntityKind::Tag => "tags",
        }
    }

    /// Directory (relative to the content root) documents of this kind live in.
    pub fn dir(self) -> &'static str {
        match self {
            EntityKind::Post => "posts/",
            EntityKind::Project => "projects/",
            EntityKind::Tag => "tags/",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Post => "post",
            EntityKind::Project => "project",
            EntityKind::Tag => "tag",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A post, project, or tag row.
///
/// Identity is `(kind, slug)`. `id` is `0` until the store assigns one on
/// first insert; it is stable across later upserts of the same slug.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub kind: EntityKind,
    pub slug: String,
    pub title: String,
    pub description: String,
    /// Rendered HTML body.
    pub content: String,
    pub banner_path: String,
    pub icon: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tag_slugs: Vec<String>,
    pub post_slugs: Vec<String>,
    pub project_slugs: Vec<String>,
    /// Fingerprint of the source file this entity was parsed from.
    pub fingerprint: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Entity {
    /// A blank entity of the given kind, used as the starting point for parsing.
    pub fn new(kind: EntityKind, slug: impl Into<String>) -> Self {
        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Self {
            id: 0,
            kind,
            slug: slug.into(),
            title: String::new(),
            description: String::new(),
            content: String::new(),
            banner_path: String::new(),
            icon: None,
            created_at: epoch,
            updated_at: epoch,
            tag_slugs: Vec::new(),
            post_slugs: Vec::new(),
            project_slugs: Vec::new(),
            fingerprint: String::new(),
            x: 0.0,
            y: 0.0,
            z: 0.0,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef {
            kind: self.kind,
            id: self.id,
        }
    }
}

/// A stored entity's kind and id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: i64,
}

/// A many-to-many join between two entities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Association {
    pub source: EntityRef,
    pub target: EntityRef,
}

/// The physical join table and column order for an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTable {
    pub table: &'static str,
    pub left_column: &'static str,
    pub right_column: &'static str,
}

impl Association {
    pub fn new(source: EntityRef, target: EntityRef) -> Self {
        Self { source, target }
    }

    /// Join table for this pair and the `(left, right)` ids to store.
    ///
    /// Mixed-kind pairs share one table regardless of direction, so a tag
    /// declaring a post lands in the same `post_to_tags` row as the post
    /// declaring the tag.
    pub fn join(&self) -> (JoinTable, i64, i64) {
        use EntityKind::*;
        let (s, t) = (self.source, self.target);
        let jt = |table, left_column, right_column| JoinTable {
            table,
            left_column,
            right_column,
        };
        match (s.kind, t.kind) {
            (Post, Post) => (jt("post_to_posts", "source_post_id", "target_post_id"), s.id, t.id),
            (Project, Project) => (
                jt("project_to_projects", "source_project_id", "target_project_id"),
                s.id,
                t.id,
            ),
            (Tag, Tag) => (jt("tag_to_tags", "source_tag_id", "target_tag_id"), s.id, t.id),
            (Post, Tag) => (jt("post_to_tags", "post_id", "tag_id"), s.id, t.id),
            (Tag, Post) => (jt("post_to_tags", "post_id", "tag_id"), t.id, s.id),
            (Post, Project) => (jt("post_to_projects", "post_id", "project_id"), s.id, t.id),
            (Project, Post) => (jt("post_to_projects", "post_id", "project_id"), t.id, s.id),
            (Project, Tag) => (jt("project_to_tags", "project_id", "tag_id"), s.id, t.id),
            (Tag, Project) => (jt("project_to_tags", "project_id", "tag_id"), t.id, s.id),
        }
    }
}

/// Every join table in the schema.
pub const JOIN_TABLES: [&str; 6] = [
    "post_to_tags",
    "post_to_posts",
    "post_to_projects",
    "project_to_tags",
    "project_to_projects",
    "tag_to_tags",
];

/// A row of the fingerprint cache table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintEntry {
    pub path: String,
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(kind: EntityKind, id: i64) -> EntityRef {
        EntityRef { kind, id }
    }

    #[test]
    fn mixed_pairs_share_a_table_in_both_directions() {
        let forward = Association::new(r(EntityKind::Post, 1), r(EntityKind::Tag, 9)).join();
        let backward = Association::new(r(EntityKind::Tag, 9), r(EntityKind::Post, 1)).join();
        assert_eq!(forward, backward);
        assert_eq!(forward.0.table, "post_to_tags");
        assert_eq!((forward.1, forward.2), (1, 9));
    }

    #[test]
    fn same_kind_pairs_keep_direction() {
        let (table, left, right) =
            Association::new(r(EntityKind::Tag, 2), r(EntityKind::Tag, 3)).join();
        assert_eq!(table.table, "tag_to_tags");
        assert_eq!((left, right), (2, 3));
    }

    #[test]
    fn every_join_is_a_known_table() {
        for a in EntityKind::ALL {
            for b in EntityKind::ALL {
                let (table, _, _) = Association::new(r(a, 1), r(b, 2)).join();
                assert!(JOIN_TABLES.contains(&table.table), "{}", table.table);
            }
        }
    }
}
