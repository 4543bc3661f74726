//! # vault-sync
//!
//! Incremental, concurrent synchronization of a content tree (markdown
//! documents plus binary media) into SQLite and an S3-compatible bucket.
//!
//! Documents under `posts/`, `projects/` and `tags/` become entities; the
//! slugs they declare in front matter become association rows. Assets are
//! uploaded by path. A fingerprint cache makes a second run over an
//! unchanged tree do nothing.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │   Scanner   │──▶│ Task queue + │──▶│ Object store│
//! │ (walkdir)   │   │ worker pool  │   │  (S3 PUT)   │
//! └─────────────┘   └──────┬───────┘   └─────────────┘
//!                          │ one-shot requests
//!                          ▼
//!                   ┌──────────────┐   ┌─────────────┐
//!                   │  DB worker   │──▶│   SQLite    │
//!                   │ (sole writer)│   │             │
//!                   └──────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! vsync init                    # create database
//! vsync sync                    # sync the content tree
//! vsync sync --full             # ignore fingerprints, resync everything
//! vsync status                  # row counts
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Entities, associations, fingerprint rows |
//! | [`error`] | Pipeline error taxonomy |
//! | [`hash`] | Content fingerprints |
//! | [`cache`] | Path and entity caches |
//! | [`content`] | Classification, slugs, front matter, validation |
//! | [`markdown`] | Markdown rendering |
//! | [`object_store`] | Asset uploads |
//! | [`embedding`] | Embedding enrichment |
//! | [`store`] | Storage trait with SQLite and in-memory backends |
//! | [`scanner`] | Content tree walker |
//! | [`pipeline`] | Queue, workers, DB worker, resolver, monitor |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |

pub mod cache;
pub mod config;
pub mod content;
pub mod db;
pub mod embedding;
pub mod error;
pub mod hash;
pub mod logging;
pub mod markdown;
pub mod migrate;
pub mod models;
pub mod object_store;
pub mod pipeline;
pub mod scanner;
pub mod store;
