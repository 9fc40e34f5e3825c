use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub extraction: ExtractionConfig,
    #[serde(default)]
    pub connectors: ConnectorsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestionConfig {
    /// Fallback interval between cycles when neither the integration nor
    /// the connector specifies one.
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,
    #[serde(default = "default_min_sync_interval_secs")]
    pub min_sync_interval_secs: u64,
    #[serde(default = "default_fetch_limit")]
    pub fetch_limit: usize,
    /// Number of processed platform IDs kept in each checkpoint.
    #[serde(default = "default_dedup_window")]
    pub dedup_window: usize,
    #[serde(default = "default_timeout_secs")]
    pub connector_timeout_secs: u64,
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            min_sync_interval_secs: default_min_sync_interval_secs(),
            fetch_limit: default_fetch_limit(),
            dedup_window: default_dedup_window(),
            connector_timeout_secs: default_timeout_secs(),
        }
    }
}

impl IngestionConfig {
    pub fn connector_timeout(&self) -> Duration {
        Duration::from_secs(self.connector_timeout_secs)
    }
}

fn default_sync_interval_secs() -> u64 {
    300
}
fn default_min_sync_interval_secs() -> u64 {
    30
}
fn default_fetch_limit() -> usize {
    500
}
fn default_dedup_window() -> usize {
    5000
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProcessingConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_batch_size() -> usize {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExtractionConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "heuristic".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConnectorsConfig {
    /// Export-replay connectors keyed by platform name.
    #[serde(default)]
    pub export: BTreeMap<String, ExportConnectorConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExportConnectorConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Overrides the connector's recommended sync interval.
    #[serde(default)]
    pub sync_interval_secs: Option<u64>,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.jsonl".to_string(), "**/*.ndjson".to_string()]
}

impl Config {
    /// Config with every section defaulted, pointing at the given database.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            ingestion: IngestionConfig::default(),
            processing: ProcessingConfig::default(),
            extraction: ExtractionConfig::default(),
            connectors: ConnectorsConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    // Validate ingestion
    if config.ingestion.fetch_limit == 0 {
        anyhow::bail!("ingestion.fetch_limit must be > 0");
    }
    if config.ingestion.dedup_window == 0 {
        anyhow::bail!("ingestion.dedup_window must be > 0");
    }
    if config.ingestion.min_sync_interval_secs == 0 {
        anyhow::bail!("ingestion.min_sync_interval_secs must be > 0");
    }

    // Validate processing
    if config.processing.batch_size == 0 {
        anyhow::bail!("processing.batch_size must be > 0");
    }
    if config.processing.timeout_secs == 0 {
        anyhow::bail!("processing.timeout_secs must be > 0");
    }

    // Validate extraction
    match config.extraction.provider.as_str() {
        "heuristic" => {}
        "openai" => {
            if config.extraction.model.is_none() {
                anyhow::bail!("extraction.model must be specified when provider is 'openai'");
            }
        }
        other => anyhow::bail!(
            "Unknown extraction provider: '{}'. Must be heuristic or openai.",
            other
        ),
    }

    for (platform, export) in &config.connectors.export {
        if platform.trim().is_empty() {
            anyhow::bail!("connectors.export keys must be non-empty platform names");
        }
        if export.include_globs.is_empty() {
            anyhow::bail!(
                "connectors.export.{}.include_globs must not be empty",
                platform
            );
        }
    }

    Ok(())
}
