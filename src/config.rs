use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub content: ContentConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ContentConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
}

/// Pipeline tuning. Durations are given in milliseconds in TOML.
#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_submit_timeout_ms")]
    pub submit_timeout_ms: u64,
    #[serde(default = "default_db_timeout_ms")]
    pub db_timeout_ms: u64,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_relationship_delay_ms")]
    pub relationship_delay_ms: u64,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_not_found")]
    pub retry_not_found: bool,
    #[serde(default = "default_monitor_tick_ms")]
    pub monitor_tick_ms: u64,
    #[serde(default = "default_inactivity_timeout_ms")]
    pub inactivity_timeout_ms: u64,
    #[serde(default = "default_status_interval_ms")]
    pub status_interval_ms: u64,
    #[serde(default = "default_completion_timeout_secs")]
    pub completion_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            submit_timeout_ms: default_submit_timeout_ms(),
            db_timeout_ms: default_db_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            relationship_delay_ms: default_relationship_delay_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_retries: default_max_retries(),
            retry_not_found: default_retry_not_found(),
            monitor_tick_ms: default_monitor_tick_ms(),
            inactivity_timeout_ms: default_inactivity_timeout_ms(),
            status_interval_ms: default_status_interval_ms(),
            completion_timeout_secs: default_completion_timeout_secs(),
        }
    }
}

impl PipelineConfig {
    pub fn submit_timeout(&self) -> Duration {
        Duration::from_millis(self.submit_timeout_ms)
    }
    pub fn db_timeout(&self) -> Duration {
        Duration::from_millis(self.db_timeout_ms)
    }
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
    pub fn relationship_delay(&self) -> Duration {
        Duration::from_millis(self.relationship_delay_ms)
    }
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
    pub fn monitor_tick(&self) -> Duration {
        Duration::from_millis(self.monitor_tick_ms)
    }
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }
    pub fn status_interval(&self) -> Duration {
        Duration::from_millis(self.status_interval_ms)
    }
    pub fn completion_timeout(&self) -> Duration {
        Duration::from_secs(self.completion_timeout_secs)
    }
}

fn default_workers() -> usize {
    20
}
fn default_queue_capacity() -> usize {
    1000
}
fn default_submit_timeout_ms() -> u64 {
    5_000
}
fn default_db_timeout_ms() -> u64 {
    10_000
}
fn default_store_timeout_ms() -> u64 {
    3_000
}
fn default_batch_size() -> usize {
    50
}
fn default_flush_interval_ms() -> u64 {
    500
}
fn default_relationship_delay_ms() -> u64 {
    100
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_not_found() -> bool {
    true
}
fn default_monitor_tick_ms() -> u64 {
    1_000
}
fn default_inactivity_timeout_ms() -> u64 {
    15_000
}
fn default_status_interval_ms() -> u64 {
    5_000
}
fn default_completion_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_provider")]
    pub provider: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint for S3-compatible services (Tigris, MinIO, LocalStack).
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default = "default_upload_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            timeout_secs: default_upload_timeout_secs(),
        }
    }
}

impl StorageConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_storage_provider() -> String {
    "disabled".to_string()
}
fn default_region() -> String {
    "auto".to_string()
}
fn default_upload_timeout_secs() -> u64 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_embedding_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_embedding_max_retries")]
    pub max_retries: u32,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model: None,
            url: None,
            timeout_secs: default_embedding_timeout_secs(),
            max_retries: default_embedding_max_retries(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

fn default_embedding_provider() -> String {
    "disabled".to_string()
}
fn default_embedding_timeout_secs() -> u64 {
    30
}
fn default_embedding_max_retries() -> u32 {
    2
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    let p = &config.pipeline;
    if p.workers == 0 {
        anyhow::bail!("pipeline.workers must be >= 1");
    }
    if p.queue_capacity == 0 {
        anyhow::bail!("pipeline.queue_capacity must be >= 1");
    }
    if p.batch_size == 0 {
        anyhow::bail!("pipeline.batch_size must be >= 1");
    }
    if p.monitor_tick_ms == 0 || p.flush_interval_ms == 0 || p.status_interval_ms == 0 {
        anyhow::bail!("pipeline tick intervals must be > 0");
    }

    match config.storage.provider.as_str() {
        "disabled" => {}
        "s3" => {
            if config.storage.bucket.is_empty() {
                anyhow::bail!("storage.bucket must be set when provider is 's3'");
            }
        }
        other => anyhow::bail!(
            "Unknown storage provider: '{}'. Must be disabled or s3.",
            other
        ),
    }

    match config.embedding.provider.as_str() {
        "disabled" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    Ok(())
}
