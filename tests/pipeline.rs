//! End-to-end pipeline tests against in-memory and SQLite stores.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tempfile::TempDir;

use vault_sync::config::{
    Config, ContentConfig, DbConfig, EmbeddingConfig, PipelineConfig, StorageConfig,
};
use vault_sync::embedding::{DisabledEmbedder, Embedder};
use vault_sync::error::PipelineError;
use vault_sync::markdown::FrontMatterMarkdown;
use vault_sync::models::{Association, Entity, EntityKind, FingerprintEntry};
use vault_sync::object_store::ObjectStore;
use vault_sync::pipeline::monitor::{DoneReason, StatsSnapshot};
use vault_sync::pipeline::task::Task;
use vault_sync::pipeline::{run_sync, Collaborators, Pipeline};
use vault_sync::store::{EntityStore, InMemoryStore, SqliteStore, StoreCounts};
use vault_sync::{db, migrate};

// ============ Fixtures ============

fn write(root: &Path, rel: &str, body: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, body).unwrap();
}

fn doc(title: &str, description: &str, extra: &str, body: &str) -> Vec<u8> {
    format!(
        "---\ntitle: {}\ndescription: {}\n{}---\n{}\n",
        title, description, extra, body
    )
    .into_bytes()
}

fn config(root: &Path) -> Config {
    Config {
        db: DbConfig {
            path: root.join("unused.sqlite"),
        },
        content: ContentConfig {
            root: root.to_path_buf(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
        },
        pipeline: PipelineConfig {
            workers: 4,
            monitor_tick_ms: 20,
            flush_interval_ms: 20,
            relationship_delay_ms: 10,
            retry_backoff_ms: 20,
            status_interval_ms: 1_000,
            inactivity_timeout_ms: 5_000,
            completion_timeout_secs: 20,
            ..PipelineConfig::default()
        },
        storage: StorageConfig::default(),
        embedding: EmbeddingConfig::default(),
    }
}

#[derive(Default)]
struct RecordingObjects {
    puts: Mutex<Vec<(String, String)>>,
}

impl RecordingObjects {
    fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.puts.lock().unwrap().iter().map(|(p, _)| p.clone()).collect();
        paths.sort();
        paths
    }
}

#[async_trait]
impl ObjectStore for RecordingObjects {
    async fn put(&self, path: &str, _bytes: &[u8], content_type: &str) -> Result<()> {
        self.puts
            .lock()
            .unwrap()
            .push((path.to_string(), content_type.to_string()));
        Ok(())
    }
}

struct FixedEmbedder(Vec<f32>);

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(self.0.clone())
    }
}

struct FailingEmbedder;

#[async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        anyhow::bail!("embedding service unreachable")
    }
}

/// Delegates to an in-memory store, counting lookups per slug and
/// optionally failing the first few lookups with a busy error.
#[derive(Default)]
struct ObservedStore {
    inner: InMemoryStore,
    lookups: Mutex<HashMap<String, usize>>,
    busy_lookups_left: Mutex<usize>,
}

impl ObservedStore {
    fn lookups(&self, slug: &str) -> usize {
        self.lookups.lock().unwrap().get(slug).copied().unwrap_or(0)
    }
}

#[async_trait]
impl EntityStore for ObservedStore {
    async fn upsert_entity(&self, entity: &Entity) -> Result<Entity> {
        self.inner.upsert_entity(entity).await
    }

    async fn find_by_slug(&self, kind: EntityKind, slug: &str) -> Result<Option<Entity>> {
        *self
            .lookups
            .lock()
            .unwrap()
            .entry(slug.to_string())
            .or_default() += 1;
        {
            let mut busy = self.busy_lookups_left.lock().unwrap();
            if *busy > 0 {
                *busy -= 1;
                anyhow::bail!("database is locked");
            }
        }
        self.inner.find_by_slug(kind, slug).await
    }

    async fn load_fingerprints(&self) -> Result<Vec<FingerprintEntry>> {
        self.inner.load_fingerprints().await
    }

    async fn upsert_fingerprints(&self, entries: &[FingerprintEntry]) -> Result<()> {
        self.inner.upsert_fingerprints(entries).await
    }

    async fn clear_fingerprints(&self) -> Result<u64> {
        self.inner.clear_fingerprints().await
    }

    async fn insert_association(&self, association: &Association) -> Result<bool> {
        self.inner.insert_association(association).await
    }

    async fn counts(&self) -> Result<StoreCounts> {
        self.inner.counts().await
    }
}

fn collaborators(
    store: Arc<dyn EntityStore>,
    objects: Arc<RecordingObjects>,
    embedder: Arc<dyn Embedder>,
) -> Collaborators {
    Collaborators {
        store,
        objects,
        embedder,
        markdown: Arc::new(FrontMatterMarkdown::new()),
    }
}

struct RunResult {
    stats: StatsSnapshot,
    errors: Vec<PipelineError>,
    reason: Option<DoneReason>,
}

/// Scan, wait for the done signal, shut down, drain the error stream.
async fn run_pipeline(config: &Config, collaborators: Collaborators) -> RunResult {
    let pipeline = Pipeline::new(config, collaborators);
    let mut errors_rx = pipeline.take_errors().unwrap();
    pipeline.start(config.pipeline.workers);
    pipeline.scan_fs().await.unwrap();
    assert!(pipeline.wait_for_completion(Duration::from_secs(10)).await);
    let reason = pipeline.completion();
    pipeline.close().await;

    let mut errors = Vec::new();
    while let Ok(e) = errors_rx.try_recv() {
        errors.push(e);
    }
    RunResult {
        stats: pipeline.stats(),
        errors,
        reason,
    }
}

fn write_small_site(root: &Path) {
    write(
        root,
        "posts/hello.md",
        &doc("Hello", "First post", "tags: [rust]\nprojects: [vault]\n", "# Hello\n\nWorld."),
    );
    write(root, "tags/rust.md", &doc("Rust", "The language", "", "Rust things."));
    write(
        root,
        "projects/vault.md",
        &doc("Vault", "This site", "tags: [rust]\n", "Project body."),
    );
    write(root, "assets/logo.png", b"\x89PNG fake image bytes");
    write(root, "notes.txt", b"not content");
}

// ============ Tests ============

#[tokio::test]
async fn first_run_saves_entities_links_and_uploads() {
    let tmp = TempDir::new().unwrap();
    write_small_site(tmp.path());
    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(RecordingObjects::default());

    let result = run_pipeline(
        &config(tmp.path()),
        collaborators(store.clone(), objects.clone(), Arc::new(DisabledEmbedder)),
    )
    .await;

    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(result.reason, Some(DoneReason::Drained));
    assert_eq!(result.stats.completed, result.stats.submitted);
    assert_eq!(result.stats.db_completed, result.stats.db_submitted);

    let counts = store.counts().await.unwrap();
    assert_eq!((counts.posts, counts.tags, counts.projects), (1, 1, 1));
    assert_eq!(counts.fingerprints, 4);
    assert_eq!(store.association_rows("post_to_tags").len(), 1);
    assert_eq!(store.association_rows("post_to_projects").len(), 1);
    assert_eq!(store.association_rows("project_to_tags").len(), 1);

    assert_eq!(objects.paths(), vec!["assets/logo.png"]);
    let hello = store
        .find_by_slug(EntityKind::Post, "hello")
        .await
        .unwrap()
        .unwrap();
    assert!(hello.content.contains("<h1>Hello</h1>"));
    assert_eq!(hello.icon.as_deref(), Some("tag"));
}

#[tokio::test]
async fn second_run_over_unchanged_tree_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    write_small_site(tmp.path());
    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(RecordingObjects::default());
    let cfg = config(tmp.path());

    let first = run_sync(
        &cfg,
        collaborators(store.clone(), objects.clone(), Arc::new(DisabledEmbedder)),
        4,
        false,
    )
    .await
    .unwrap();
    assert!(first.completed_cleanly, "{:?}", first.errors);
    let writes = store.entity_writes();
    let uploads = objects.paths().len();
    assert_eq!((writes, uploads), (3, 1));

    let second = run_sync(
        &cfg,
        collaborators(store.clone(), objects.clone(), Arc::new(DisabledEmbedder)),
        4,
        false,
    )
    .await
    .unwrap();
    assert!(second.completed_cleanly, "{:?}", second.errors);
    assert_eq!(second.relationships, 0);
    assert_eq!(store.entity_writes(), writes);
    assert_eq!(objects.paths().len(), uploads);
}

#[tokio::test]
async fn changed_file_is_reprocessed() {
    let tmp = TempDir::new().unwrap();
    write_small_site(tmp.path());
    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(RecordingObjects::default());
    let cfg = config(tmp.path());

    run_pipeline(&cfg, collaborators(store.clone(), objects.clone(), Arc::new(DisabledEmbedder))).await;
    let writes = store.entity_writes();

    write(tmp.path(), "tags/rust.md", &doc("Rust", "Edited", "", "Rust things, edited."));
    let result =
        run_pipeline(&cfg, collaborators(store.clone(), objects.clone(), Arc::new(DisabledEmbedder))).await;

    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(store.entity_writes(), writes + 1);
    let rust = store
        .find_by_slug(EntityKind::Tag, "rust")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(rust.description, "Edited");
}

#[tokio::test]
async fn identical_content_at_two_paths_uploads_twice() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "assets/a.png", b"same bytes");
    write(tmp.path(), "assets/copies/b.png", b"same bytes");
    let objects = Arc::new(RecordingObjects::default());

    let result = run_pipeline(
        &config(tmp.path()),
        collaborators(
            Arc::new(InMemoryStore::new()),
            objects.clone(),
            Arc::new(DisabledEmbedder),
        ),
    )
    .await;

    assert!(result.errors.is_empty());
    assert_eq!(objects.paths(), vec!["assets/a.png", "assets/copies/b.png"]);
}

#[tokio::test]
async fn video_is_fingerprinted_but_not_uploaded() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "assets/clip.mp4", b"video");
    let store = Arc::new(InMemoryStore::new());
    let objects = Arc::new(RecordingObjects::default());

    run_pipeline(
        &config(tmp.path()),
        collaborators(store.clone(), objects.clone(), Arc::new(DisabledEmbedder)),
    )
    .await;

    assert!(objects.paths().is_empty());
    assert!(store.fingerprint("assets/clip.mp4").is_some());
}

#[tokio::test]
async fn missing_tag_is_retried_three_times_then_reported() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "posts/a.md", &doc("A", "Refers to b", "tags: [b]\n", "Body."));
    let store = Arc::new(ObservedStore::default());

    let result = run_pipeline(
        &config(tmp.path()),
        collaborators(
            store.clone(),
            Arc::new(RecordingObjects::default()),
            Arc::new(DisabledEmbedder),
        ),
    )
    .await;

    // One execution plus three retries.
    assert_eq!(store.lookups("b"), 4);
    assert_eq!(result.stats.relationships_submitted, 4);
    assert_eq!(result.errors.len(), 1, "{:?}", result.errors);
    match &result.errors[0] {
        PipelineError::RetriesExhausted { attempts, source, .. } => {
            assert_eq!(*attempts, 4);
            assert!(source.is_not_found());
        }
        other => panic!("expected RetriesExhausted, got {:?}", other),
    }

    // The post itself was saved and stays queryable.
    assert!(store
        .find_by_slug(EntityKind::Post, "a")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn not_found_fails_fast_when_policy_disables_retry() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "posts/a.md", &doc("A", "Refers to b", "tags: [b]\n", "Body."));
    let store = Arc::new(ObservedStore::default());
    let mut cfg = config(tmp.path());
    cfg.pipeline.retry_not_found = false;

    let result = run_pipeline(
        &cfg,
        collaborators(
            store.clone(),
            Arc::new(RecordingObjects::default()),
            Arc::new(DisabledEmbedder),
        ),
    )
    .await;

    assert_eq!(store.lookups("b"), 1);
    assert_eq!(result.errors.len(), 1);
    assert!(result.errors[0].is_not_found());
}

#[tokio::test]
async fn busy_store_is_retried_even_when_not_found_fails_fast() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "posts/a.md", &doc("A", "Tagged", "tags: [rust]\n", "Body."));
    let store = Arc::new(ObservedStore::default());
    // Saved by an earlier run, so only the store knows it.
    let mut rust = Entity::new(EntityKind::Tag, "rust");
    rust.description = "Lang".into();
    store.inner.upsert_entity(&rust).await.unwrap();
    *store.busy_lookups_left.lock().unwrap() = 2;
    let mut cfg = config(tmp.path());
    cfg.pipeline.retry_not_found = false;

    let result = run_pipeline(
        &cfg,
        collaborators(
            store.clone(),
            Arc::new(RecordingObjects::default()),
            Arc::new(DisabledEmbedder),
        ),
    )
    .await;

    assert!(result.errors.is_empty(), "{:?}", result.errors);
    assert_eq!(store.lookups("rust"), 3);
    assert_eq!(store.inner.association_rows("post_to_tags"), vec![(1, 1)]);
}

#[tokio::test]
async fn invalid_document_is_reported_and_others_still_sync() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "posts/bad.md", b"---\ntitle: No description\n---\nBody.\n");
    write(tmp.path(), "posts/good.md", &doc("Good", "Fine", "", "Body."));
    let store = Arc::new(InMemoryStore::new());

    let result = run_pipeline(
        &config(tmp.path()),
        collaborators(
            store.clone(),
            Arc::new(RecordingObjects::default()),
            Arc::new(DisabledEmbedder),
        ),
    )
    .await;

    assert_eq!(result.errors.len(), 1);
    match &result.errors[0] {
        PipelineError::Validation { path, problems } => {
            assert_eq!(path, "posts/bad.md");
            assert!(problems.iter().any(|p| p.contains("description")));
        }
        other => panic!("expected Validation, got {:?}", other),
    }
    assert!(store.find_by_slug(EntityKind::Post, "good").await.unwrap().is_some());
    assert!(store.find_by_slug(EntityKind::Post, "bad").await.unwrap().is_none());
    // A failed document is not fingerprinted, so the next run tries again.
    assert!(store.fingerprint("posts/bad.md").is_none());
}

#[tokio::test]
async fn concurrent_saves_of_one_slug_leave_one_input() {
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(InMemoryStore::new());
    let mut cfg = config(tmp.path());
    cfg.pipeline.workers = 8;

    let pipeline = Pipeline::new(
        &cfg,
        collaborators(
            store.clone(),
            Arc::new(RecordingObjects::default()),
            Arc::new(DisabledEmbedder),
        ),
    );
    pipeline.start(cfg.pipeline.workers);

    let descriptions: Vec<String> = (0..16).map(|i| format!("version {}", i)).collect();
    for d in &descriptions {
        let task = Task::document("posts/same.md").with_content(doc("Same", d, "", "Body."));
        pipeline.submit_task(task).await.unwrap();
    }
    pipeline.finish_submissions();
    assert!(pipeline.wait_for_completion(Duration::from_secs(10)).await);
    pipeline.close().await;

    assert_eq!(store.counts().await.unwrap().posts, 1);
    let saved = store
        .find_by_slug(EntityKind::Post, "same")
        .await
        .unwrap()
        .unwrap();
    assert!(descriptions.contains(&saved.description));
    assert_eq!(saved.title, "Same");
}

#[tokio::test]
async fn embedding_failure_keeps_the_document() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "tags/go.md", &doc("Go", "Lang", "", "Go things."));
    let store = Arc::new(InMemoryStore::new());

    let result = run_pipeline(
        &config(tmp.path()),
        collaborators(
            store.clone(),
            Arc::new(RecordingObjects::default()),
            Arc::new(FailingEmbedder),
        ),
    )
    .await;

    assert!(result.errors.is_empty());
    let go = store.find_by_slug(EntityKind::Tag, "go").await.unwrap().unwrap();
    assert_eq!((go.x, go.y, go.z), (0.0, 0.0, 0.0));
}

#[tokio::test]
async fn embedding_sets_coordinates() {
    let tmp = TempDir::new().unwrap();
    write(tmp.path(), "tags/go.md", &doc("Go", "Lang", "", "Go things."));
    let store = Arc::new(InMemoryStore::new());

    run_pipeline(
        &config(tmp.path()),
        collaborators(
            store.clone(),
            Arc::new(RecordingObjects::default()),
            Arc::new(FixedEmbedder(vec![1.0; 30])),
        ),
    )
    .await;

    let go = store.find_by_slug(EntityKind::Tag, "go").await.unwrap().unwrap();
    assert!(go.x > 0.0 && go.y > 0.0 && go.z > 0.0);
}

#[tokio::test]
async fn full_resync_on_sqlite_never_duplicates_associations() {
    let tmp = TempDir::new().unwrap();
    let content = tmp.path().join("content");
    write_small_site(&content);
    let mut cfg = config(&content);
    cfg.db.path = tmp.path().join("data/vault.sqlite");

    let pool = db::connect(&cfg).await.unwrap();
    migrate::apply(&pool).await.unwrap();
    let store: Arc<dyn EntityStore> = Arc::new(SqliteStore::new(pool.clone()));

    let first = run_sync(
        &cfg,
        collaborators(store.clone(), Arc::new(RecordingObjects::default()), Arc::new(DisabledEmbedder)),
        4,
        false,
    )
    .await
    .unwrap();
    first.ensure_clean().unwrap();
    let before = store.counts().await.unwrap();
    assert_eq!(before.associations, 3);
    assert_eq!(before.fingerprints, 4);

    let objects = Arc::new(RecordingObjects::default());
    let second = run_sync(
        &cfg,
        collaborators(store.clone(), objects.clone(), Arc::new(DisabledEmbedder)),
        4,
        true,
    )
    .await
    .unwrap();
    second.ensure_clean().unwrap();

    assert_eq!(store.counts().await.unwrap(), before);
    assert_eq!(objects.paths(), vec!["assets/logo.png"]);
    assert_eq!(second.relationships, 3);
    pool.close().await;
}
