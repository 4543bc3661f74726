//! Units of work consumed by the worker pool.

use crate::models::{Entity, EntityKind, EntityRef};

/// What a worker does with a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskKind {
    /// Binary media: fingerprint, upload, record fingerprint.
    Asset,
    /// Markdown: fingerprint, render, validate, save, schedule relationships.
    Document,
    /// Resolve a saved entity's declared references into association rows.
    Relationship(RelationshipRequest),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub kind: TaskKind,
    /// Path relative to the content root.
    pub path: String,
    /// Pre-loaded bytes; read from disk when `None`.
    pub content: Option<Vec<u8>>,
    pub retry_count: u32,
}

impl Task {
    pub fn asset(path: impl Into<String>) -> Self {
        Self::new(TaskKind::Asset, path)
    }

    pub fn document(path: impl Into<String>) -> Self {
        Self::new(TaskKind::Document, path)
    }

    pub fn relationship(path: impl Into<String>, request: RelationshipRequest) -> Self {
        Self::new(TaskKind::Relationship(request), path)
    }

    fn new(kind: TaskKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            content: None,
            retry_count: 0,
        }
    }

    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// A fresh copy for the next attempt.
    pub fn retried(&self) -> Self {
        Self {
            retry_count: self.retry_count + 1,
            ..self.clone()
        }
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            TaskKind::Asset => "asset",
            TaskKind::Document => "document",
            TaskKind::Relationship(_) => "relationship",
        }
    }
}

/// The data the database worker needs to resolve one entity's references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationshipRequest {
    pub entity: EntityRef,
    pub slug: String,
    pub tag_slugs: Vec<String>,
    pub post_slugs: Vec<String>,
    pub project_slugs: Vec<String>,
}

impl RelationshipRequest {
    pub fn for_entity(entity: &Entity) -> Self {
        Self {
            entity: entity.entity_ref(),
            slug: entity.slug.clone(),
            tag_slugs: entity.tag_slugs.clone(),
            post_slugs: entity.post_slugs.clone(),
            project_slugs: entity.project_slugs.clone(),
        }
    }

    pub fn declared(&self) -> [(EntityKind, &[String]); 3] {
        [
            (EntityKind::Tag, self.tag_slugs.as_slice()),
            (EntityKind::Post, self.post_slugs.as_slice()),
            (EntityKind::Project, self.project_slugs.as_slice()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.declared().iter().all(|(_, slugs)| slugs.is_empty())
    }
}
