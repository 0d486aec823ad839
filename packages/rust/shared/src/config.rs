//! Application configuration for Shelfscrape.
//!
//! User config lives at `~/.shelfscrape/shelfscrape.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShelfscrapeError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "shelfscrape.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".shelfscrape";

// ---------------------------------------------------------------------------
// Config structs (matching shelfscrape.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Schema cache policy.
    #[serde(default)]
    pub schema: SchemaConfig,

    /// Category discovery policy.
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path to the crawl database.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Concurrent page fetches per domain.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Retry attempts for transient render/model failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff between retries in milliseconds (scales linearly).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Hard byte cap applied to reduced HTML before any model call.
    #[serde(default = "default_max_model_bytes")]
    pub max_model_bytes: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            concurrency: default_concurrency(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            max_model_bytes: default_max_model_bytes(),
        }
    }
}

fn default_db_path() -> String {
    "~/.shelfscrape/crawl.db".into()
}
fn default_concurrency() -> u32 {
    3
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    500
}
fn default_max_model_bytes() -> usize {
    120_000
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL (overridable for tests).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model used to classify candidate category links.
    #[serde(default = "default_classify_model")]
    pub classify_model: String,

    /// Model used to generate extraction schemas.
    #[serde(default = "default_schema_model")]
    pub schema_model: String,

    /// Model used for direct product extraction (fallback path).
    #[serde(default = "default_extract_model")]
    pub extract_model: String,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            classify_model: default_classify_model(),
            schema_model: default_schema_model(),
            extract_model: default_extract_model(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_classify_model() -> String {
    "meta-llama/llama-4-scout-17b-16e-instruct".into()
}
fn default_schema_model() -> String {
    "openai/gpt-4.1".into()
}
fn default_extract_model() -> String {
    "meta-llama/llama-4-scout-17b-16e-instruct".into()
}

/// `[schema]` section — cache and drift policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaConfig {
    /// Seconds a cached schema stays fresh before regeneration.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u64,

    /// Consecutive zero-product schema pages that invalidate the schema.
    #[serde(default = "default_drift_threshold")]
    pub drift_threshold: u32,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            refresh_secs: default_refresh_secs(),
            drift_threshold: default_drift_threshold(),
        }
    }
}

fn default_refresh_secs() -> u64 {
    3600
}
fn default_drift_threshold() -> u32 {
    3
}

/// `[discovery]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Extra hosts accepted as same-site during link normalization.
    #[serde(default)]
    pub allowed_subdomains: Vec<String>,

    /// Candidates per classification batch sent to the model.
    #[serde(default = "default_classify_batch")]
    pub classify_batch: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            allowed_subdomains: Vec::new(),
            classify_batch: default_classify_batch(),
        }
    }
}

fn default_classify_batch() -> usize {
    40
}

// ---------------------------------------------------------------------------
// Run config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration — merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Concurrent page fetches per domain.
    pub concurrency: u32,
    /// Retry attempts for transient failures.
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds.
    pub retry_backoff_ms: u64,
    /// Byte cap for model input.
    pub max_model_bytes: usize,
    /// Schema refresh interval in seconds.
    pub schema_refresh_secs: u64,
    /// Drift invalidation threshold.
    pub drift_threshold: u32,
    /// Subdomain allow-list.
    pub allowed_subdomains: Vec<String>,
    /// Classification batch size.
    pub classify_batch: usize,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.defaults.concurrency,
            max_retries: config.defaults.max_retries,
            retry_backoff_ms: config.defaults.retry_backoff_ms,
            max_model_bytes: config.defaults.max_model_bytes,
            schema_refresh_secs: config.schema.refresh_secs,
            drift_threshold: config.schema.drift_threshold,
            allowed_subdomains: config.discovery.allowed_subdomains.clone(),
            classify_batch: config.discovery.classify_batch,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.shelfscrape/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ShelfscrapeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.shelfscrape/shelfscrape.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ShelfscrapeError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ShelfscrapeError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ShelfscrapeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ShelfscrapeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ShelfscrapeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Resolve the database path, expanding a leading `~`.
pub fn resolve_db_path(config: &AppConfig, override_path: Option<&str>) -> Result<PathBuf> {
    let raw = override_path.unwrap_or(&config.defaults.db_path);
    if let Some(rest) = raw.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| ShelfscrapeError::config("could not determine home directory"))?;
        Ok(home.join(rest))
    } else {
        Ok(PathBuf::from(raw))
    }
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(ShelfscrapeError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}
