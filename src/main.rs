//! # vault-sync CLI (`vsync`)
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `vsync init` | Create the SQLite database and run schema migrations |
//! | `vsync sync` | Sync the content tree into the database and bucket |
//! | `vsync status` | Show entity, association and fingerprint counts |
//!
//! ## Examples
//!
//! ```bash
//! vsync init --config ./config/vsync.toml
//! vsync sync --workers 8 --config ./config/vsync.toml
//! RUST_LOG=vault_sync=debug vsync sync --full
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};

use vault_sync::embedding::create_embedder;
use vault_sync::markdown::FrontMatterMarkdown;
use vault_sync::object_store::create_object_store;
use vault_sync::pipeline::{self, Collaborators};
use vault_sync::store::{EntityStore, SqliteStore};
use vault_sync::{config, db, logging, migrate};

/// vault-sync: incremental content sync into SQLite and object storage.
#[derive(Parser)]
#[command(name = "vsync", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/vsync.toml")]
    config: PathBuf,

    /// Debug-level logging (overridden by `RUST_LOG`).
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Sync the content tree.
    ///
    /// Unchanged files (same fingerprint as the last successful run) are
    /// skipped. Individual file failures are reported at the end and make
    /// the command exit non-zero; they never stop the run.
    Sync {
        /// Number of workers; defaults to `pipeline.workers`.
        #[arg(long)]
        workers: Option<usize>,

        /// Forget all fingerprints first and process every file.
        #[arg(long)]
        full: bool,
    },

    /// Show row counts.
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Sync { workers, full } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply(&pool).await?;

            let collaborators = Collaborators {
                store: Arc::new(SqliteStore::new(pool.clone())),
                objects: Arc::from(create_object_store(&cfg.storage)?),
                embedder: Arc::from(create_embedder(&cfg.embedding)?),
                markdown: Arc::new(FrontMatterMarkdown::new()),
            };
            let worker_count = workers.unwrap_or(cfg.pipeline.workers);
            let report = pipeline::run_sync(&cfg, collaborators, worker_count, full).await?;
            pool.close().await;

            println!("sync {}", cfg.content.root.display());
            println!("  tasks: {} / {} completed", report.completed, report.submitted);
            println!("  relationship tasks: {}", report.relationships);
            println!("  db requests: {}", report.db_requests);
            println!("  errors: {}", report.errors.len());
            println!("  elapsed: {} ms", report.elapsed_ms);
            if !report.completed_cleanly && report.errors.is_empty() {
                println!("  warning: run ended before all work drained");
            }
            report.ensure_clean()?;
            println!("ok");
        }
        Commands::Status => {
            let pool = db::connect(&cfg).await?;
            let counts = SqliteStore::new(pool.clone()).counts().await?;
            pool.close().await;

            println!("posts:        {}", counts.posts);
            println!("projects:     {}", counts.projects);
            println!("tags:         {}", counts.tags);
            println!("associations: {}", counts.associations);
            println!("fingerprints: {}", counts.fingerprints);
        }
    }

    Ok(())
}
