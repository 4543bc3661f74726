//! Content tree walker.
//!
//! Walks the content root once, drops excluded and unclassified files, and
//! returns one [`Task`] per document or asset in path order. Paths on the
//! returned tasks are relative to the root and always use `/`.

use anyhow::{bail, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::config::ContentConfig;
use crate::content::{self, ContentClass};
use crate::pipeline::task::Task;

const DEFAULT_EXCLUDES: [&str; 4] = [
    "**/.git/**",
    "**/target/**",
    "**/node_modules/**",
    "**/.DS_Store",
];

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    pub exclude_globs: Vec<String>,
    pub follow_symlinks: bool,
}

impl From<&ContentConfig> for ScanOptions {
    fn from(config: &ContentConfig) -> Self {
        Self {
            root: config.root.clone(),
            exclude_globs: config.exclude_globs.clone(),
            follow_symlinks: config.follow_symlinks,
        }
    }
}

pub fn scan(options: &ScanOptions) -> Result<Vec<Task>> {
    let root = &options.root;
    if !root.is_dir() {
        bail!("Content root does not exist: {}", root.display());
    }

    let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
    excludes.extend(options.exclude_globs.iter().cloned());
    let exclude_set = build_globset(&excludes)?;

    let mut tasks = Vec::new();
    let mut ignored = 0usize;

    for entry in WalkDir::new(root).follow_links(options.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let rel = relative_path(root, entry.path());
        if exclude_set.is_match(&rel) {
            continue;
        }

        match content::classify(&rel) {
            Some(ContentClass::Document(_)) => tasks.push(Task::document(rel)),
            Some(ContentClass::Asset) => tasks.push(Task::asset(rel)),
            None => ignored += 1,
        }
    }

    tasks.sort_by(|a, b| a.path.cmp(&b.path));
    tracing::debug!(
        root = %root.display(),
        tasks = tasks.len(),
        ignored,
        "scanned content tree"
    );
    Ok(tasks)
}

/// `path` relative to `root`, with `/` separators on every platform.
pub fn relative_path(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}
