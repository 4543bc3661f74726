//! Content tree conventions: which files are documents or assets, the
//! content type of an asset, how a document path becomes a slug, and how
//! front matter is decoded, defaulted and validated.
//!
//! Paths handled here are always relative to the content root and use `/`
//! separators (see [`scanner::relative_path`](crate::scanner::relative_path)).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer};

use crate::error::PipelineError;
use crate::models::{Entity, EntityKind};

/// Icon given to documents whose front matter names none.
pub const DEFAULT_ICON: &str = "tag";

/// What the pipeline does with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentClass {
    Document(EntityKind),
    Asset,
}

/// Media types accepted as assets.
const ASSET_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/gif",
    "image/webp",
    "image/avif",
    "image/tiff",
    "image/svg+xml",
    "application/pdf",
    "audio/mpeg",
    "audio/wav",
    "video/mp4",
    "video/webm",
    "video/quicktime",
];

/// Classify a relative path, or `None` if the pipeline ignores it.
pub fn classify(path: &str) -> Option<ContentClass> {
    if path.ends_with(".md") {
        return document_kind(path).map(ContentClass::Document);
    }
    if ASSET_TYPES.contains(&content_type(path)) {
        return Some(ContentClass::Asset);
    }
    None
}

/// The entity kind implied by a document's top-level directory.
pub fn document_kind(path: &str) -> Option<EntityKind> {
    EntityKind::ALL
        .into_iter()
        .find(|kind| path.starts_with(kind.dir()))
}

/// Content type by file extension, falling back to `application/octet-stream`.
pub fn content_type(path: &str) -> &'static str {
    let ext = match path.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.contains('/') => ext.to_ascii_lowercase(),
        _ => return "application/octet-stream",
    };
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "webp" => "image/webp",
        "avif" => "image/avif",
        "tif" | "tiff" => "image/tiff",
        "ico" => "image/x-icon",
        "css" => "text/css",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "pdf" => "application/pdf",
        "xml" => "application/xml",
        "zip" => "application/zip",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        _ => "application/octet-stream",
    }
}

/// Video assets are classified but never uploaded.
pub fn is_video(content_type: &str) -> bool {
    matches!(content_type, "video/mp4" | "video/quicktime" | "video/webm")
}

/// Strip `.md` and the kind directory: `posts/a/b.md` → `a/b`.
pub fn slugify(path: &str) -> String {
    let stem = path.strip_suffix(".md").unwrap_or(path);
    EntityKind::ALL
        .into_iter()
        .find_map(|kind| stem.strip_prefix(kind.dir()))
        .unwrap_or(stem)
        .to_string()
}

/// YAML front matter of a document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FrontMatter {
    pub title: String,
    pub description: String,
    pub banner_path: String,
    pub icon: Option<String>,
    #[serde(deserialize_with = "deserialize_date")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(deserialize_with = "deserialize_date")]
    pub updated_at: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub posts: Vec<String>,
    pub projects: Vec<String>,
}

impl FrontMatter {
    pub fn apply_defaults(&mut self) {
        if matches!(self.icon.as_deref(), None | Some("")) {
            self.icon = Some(DEFAULT_ICON.to_string());
        }
    }
}

/// Decode the raw YAML block. An absent block yields all defaults.
pub fn decode_front_matter(path: &str, raw: Option<&str>) -> Result<FrontMatter, PipelineError> {
    let raw = match raw {
        Some(r) if !r.trim().is_empty() => r,
        _ => return Ok(FrontMatter::default()),
    };
    serde_yaml::from_str(raw).map_err(|e| PipelineError::Parse {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// Accepts `YYYY-MM-DD` or RFC 3339.
pub fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc());
    }
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn deserialize_date<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) if s.trim().is_empty() => Ok(None),
        Some(s) => parse_date(&s)
            .map(Some)
            .ok_or_else(|| serde::de::Error::custom(format!("cannot parse {:?} as date", s))),
    }
}

/// Assemble an entity from a parsed document.
pub fn build_entity(
    kind: EntityKind,
    path: &str,
    fingerprint: &str,
    html: String,
    mut front: FrontMatter,
) -> Entity {
    front.apply_defaults();
    let mut entity = Entity::new(kind, slugify(path));
    entity.title = front.title;
    entity.description = front.description;
    entity.content = html;
    entity.banner_path = front.banner_path;
    entity.icon = front.icon;
    if let Some(created) = front.created_at {
        entity.created_at = created;
    }
    entity.updated_at = front.updated_at.unwrap_or(entity.created_at);
    entity.tag_slugs = front.tags;
    entity.post_slugs = front.posts;
    entity.project_slugs = front.projects;
    entity.fingerprint = fingerprint.to_string();
    entity
}

/// Required fields present and slug well formed. Every problem is reported.
pub fn validate(path: &str, entity: &Entity) -> Result<(), PipelineError> {
    let mut problems = Vec::new();
    if entity.slug.is_empty() {
        problems.push("missing slug".to_string());
    }
    if entity.description.trim().is_empty() {
        problems.push("missing description".to_string());
    }
    if entity.content.trim().is_empty() {
        problems.push("missing content".to_string());
    }
    if entity.slug.chars().any(char::is_whitespace) {
        problems.push(format!("slug {:?} contains whitespace", entity.slug));
    }

    if problems.is_empty() {
        Ok(())
    } else {
        Err(PipelineError::Validation {
            path: path.to_string(),
            problems,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_documents_by_directory() {
        assert_eq!(
            classify("posts/hello.md"),
            Some(ContentClass::Document(EntityKind::Post))
        );
        assert_eq!(
            classify("projects/x/y.md"),
            Some(ContentClass::Document(EntityKind::Project))
        );
        assert_eq!(
            classify("tags/rust.md"),
            Some(ContentClass::Document(EntityKind::Tag))
        );
        assert_eq!(classify("README.md"), None);
        assert_eq!(classify("drafts/a.md"), None);
    }

    #[test]
    fn classifies_assets_by_media_type() {
        assert_eq!(classify("assets/a.PNG"), Some(ContentClass::Asset));
        assert_eq!(classify("assets/doc.pdf"), Some(ContentClass::Asset));
        assert_eq!(classify("assets/clip.mp4"), Some(ContentClass::Asset));
        assert_eq!(classify("assets/style.css"), None);
        assert_eq!(classify("Makefile"), None);
    }

    #[test]
    fn content_type_falls_back() {
        assert_eq!(content_type("a/b.jpeg"), "image/jpeg");
        assert_eq!(content_type("a/b.unknown"), "application/octet-stream");
        assert_eq!(content_type("dir.d/noext"), "application/octet-stream");
        assert_eq!(content_type(".hidden"), "application/octet-stream");
        assert!(is_video(content_type("x.mov")));
        assert!(!is_video(content_type("x.mp3")));
    }

    #[test]
    fn slugify_strips_kind_dir_and_extension() {
        assert_eq!(slugify("posts/a/b.md"), "a/b");
        assert_eq!(slugify("tags/rust.md"), "rust");
        assert_eq!(slugify("projects/vault.md"), "vault");
    }

    #[test]
    fn front_matter_dates_accept_both_formats() {
        let fm = decode_front_matter(
            "posts/a.md",
            Some("title: A\ncreated_at: 2024-03-01\nupdated_at: 2024-03-02T10:00:00Z\ntags: [rust]\n"),
        )
        .unwrap();
        assert_eq!(fm.title, "A");
        assert_eq!(fm.created_at.unwrap().to_rfc3339(), "2024-03-01T00:00:00+00:00");
        assert_eq!(fm.updated_at.unwrap().to_rfc3339(), "2024-03-02T10:00:00+00:00");
        assert_eq!(fm.tags, vec!["rust"]);
    }

    #[test]
    fn bad_date_is_a_parse_error() {
        let err = decode_front_matter("posts/a.md", Some("created_at: yesterday\n")).unwrap_err();
        assert!(matches!(err, PipelineError::Parse { .. }));
    }

    #[test]
    fn missing_icon_defaults_to_tag() {
        let entity = build_entity(
            EntityKind::Post,
            "posts/a.md",
            "fp",
            "<p>x</p>".into(),
            FrontMatter::default(),
        );
        assert_eq!(entity.icon.as_deref(), Some(DEFAULT_ICON));
        assert_eq!(entity.slug, "a");
        assert_eq!(entity.fingerprint, "fp");
    }

    #[test]
    fn validation_reports_every_problem() {
        let entity = build_entity(
            EntityKind::Post,
            "posts/has space.md",
            "fp",
            String::new(),
            FrontMatter::default(),
        );
        match validate("posts/has space.md", &entity) {
            Err(PipelineError::Validation { problems, .. }) => {
                assert_eq!(problems.len(), 3, "{:?}", problems);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn complete_document_validates() {
        let front = FrontMatter {
            description: "d".into(),
            ..Default::default()
        };
        let entity = build_entity(EntityKind::Tag, "tags/go.md", "fp", "<p>go</p>".into(), front);
        assert!(validate("tags/go.md", &entity).is_ok());
    }
}
