//! Application configuration for repoqa.
//!
//! User config lives at `~/.repoqa/repoqa.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RepoQaError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "repoqa.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".repoqa";

// ---------------------------------------------------------------------------
// Config structs (matching repoqa.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Search and answer defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Subject domain the assistant answers questions about.
    #[serde(default)]
    pub domain: DomainConfig,

    /// OpenRouter settings.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,

    /// Retry/backoff policy for pipeline steps.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Search result cache.
    #[serde(default)]
    pub cache: CacheConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Path of the repository index database.
    #[serde(default = "default_index_path")]
    pub index_path: String,

    /// Directory holding checkouts cloned by `repoqa index --url`.
    #[serde(default = "default_checkouts_path")]
    pub checkouts_path: String,

    /// Repositories searched when the analyzer does not narrow the set.
    /// Empty means every indexed repository.
    #[serde(default)]
    pub repositories: Vec<String>,

    /// Maximum ranked documents returned by a search.
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Minimum cosine similarity for semantic hits.
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,

    /// Documents below this relevance are not cited.
    #[serde(default = "default_relevance_floor")]
    pub relevance_floor: f64,

    /// Maximum documents cited in an answer.
    #[serde(default = "default_max_sources")]
    pub max_sources: usize,

    /// Token budget per cited document.
    #[serde(default = "default_source_token_budget")]
    pub source_token_budget: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            index_path: default_index_path(),
            checkouts_path: default_checkouts_path(),
            repositories: Vec::new(),
            max_results: default_max_results(),
            min_similarity: default_min_similarity(),
            relevance_floor: default_relevance_floor(),
            max_sources: default_max_sources(),
            source_token_budget: default_source_token_budget(),
        }
    }
}

fn default_index_path() -> String {
    "~/.repoqa/index.db".into()
}
fn default_checkouts_path() -> String {
    "~/.repoqa/repos".into()
}
fn default_max_results() -> usize {
    20
}
fn default_min_similarity() -> f64 {
    0.3
}
fn default_relevance_floor() -> f64 {
    0.6
}
fn default_max_sources() -> usize {
    5
}
fn default_source_token_budget() -> usize {
    1500
}

/// `[domain]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// One-sentence description used by the relevance check.
    #[serde(default = "default_domain_description")]
    pub description: String,

    /// Known sub-domains the relevance check may tag.
    #[serde(default = "default_domains")]
    pub domains: Vec<String>,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self {
            description: default_domain_description(),
            domains: default_domains(),
        }
    }
}

fn default_domain_description() -> String {
    "Groundwater modelling with MODFLOW, FloPy and related hydrology tools".into()
}
fn default_domains() -> Vec<String> {
    vec![
        "modflow".into(),
        "flopy".into(),
        "groundwater".into(),
        "hydrology".into(),
    ]
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API base URL (OpenAI-compatible).
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Chat model used by every analysis step.
    #[serde(default = "default_model")]
    pub model: String,

    /// Embedding model used for semantic search.
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,

    /// HTTP timeout per request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            model: default_model(),
            embedding_model: default_embedding_model(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_model() -> String {
    "google/gemini-2.0-flash-001".into()
}
fn default_embedding_model() -> String {
    "openai/text-embedding-3-small".into()
}
fn default_timeout_secs() -> u64 {
    60
}

/// `[retry]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: u32,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Uniform random jitter added on top of each delay.
    #[serde(default = "default_max_jitter_ms")]
    pub max_jitter_ms: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            multiplier: default_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            max_jitter_ms: default_max_jitter_ms(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1000
}
fn default_multiplier() -> u32 {
    2
}
fn default_max_delay_ms() -> u64 {
    8000
}
fn default_max_jitter_ms() -> u64 {
    1000
}
fn default_max_retries() -> u32 {
    2
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_cache_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: default_cache_ttl(),
            max_entries: default_cache_entries(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_cache_ttl() -> u64 {
    15 * 60
}
fn default_cache_entries() -> u64 {
    1000
}

// ---------------------------------------------------------------------------
// Pipeline config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime settings for one orchestrator, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Repositories searched by default (empty = all indexed).
    pub repositories: Vec<String>,
    pub max_results: usize,
    pub min_similarity: f64,
    pub relevance_floor: f64,
    pub max_sources: usize,
    pub source_token_budget: usize,
    pub domain_description: String,
    pub domains: Vec<String>,
    pub retry: RetryConfig,
    /// Cache entry lifetime in seconds.
    pub cache_ttl_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for PipelineConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            repositories: config.defaults.repositories.clone(),
            max_results: config.defaults.max_results,
            min_similarity: config.defaults.min_similarity,
            relevance_floor: config.defaults.relevance_floor,
            max_sources: config.defaults.max_sources,
            source_token_budget: config.defaults.source_token_budget,
            domain_description: config.domain.description.clone(),
            domains: config.domain.domains.clone(),
            retry: config.retry.clone(),
            cache_ttl_secs: config.cache.ttl_secs,
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.repoqa/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| RepoQaError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.repoqa/repoqa.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| RepoQaError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        RepoQaError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| RepoQaError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| RepoQaError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| RepoQaError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}

/// Read the OpenRouter API key from the configured env var.
pub fn api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(RepoQaError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

/// Check that the OpenRouter API key env var is set and non-empty.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    api_key(config).map(|_| ())
}
