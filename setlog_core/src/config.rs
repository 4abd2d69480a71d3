//! Configuration file support for setlog.
//!
//! Configuration is loaded from `$XDG_CONFIG_HOME/setlog/config.toml`.
//! Every section is optional; missing keys fall back to the defaults
//! below, which are also the documented policy constants.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Inclusive: a confidence exactly at the threshold is accepted
pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.5;
pub const DEFAULT_EXTRACTION_RETRIES: u32 = 2;
pub const DEFAULT_FULLTEXT_THRESHOLD: f64 = 0.5;
pub const DEFAULT_TRIGRAM_THRESHOLD: f64 = 0.3;
pub const DEFAULT_SEMANTIC_MAX_DISTANCE: f64 = 0.25;

/// Application configuration
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub data: DataConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub validation: ValidationConfig,

    #[serde(default)]
    pub extraction: ExtractionConfig,

    #[serde(default)]
    pub resolver: ResolverConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

/// Data storage configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            max_connections: default_max_connections(),
        }
    }
}

impl DataConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

/// LLM endpoint configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Name of the environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Deadline for a single completion, enforced by the pipeline
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default)]
    pub temperature: f32,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: Option<u32>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_llm_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Validation stage policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,

    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            max_input_chars: default_max_input_chars(),
        }
    }
}

/// Extraction stage policy
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Re-prompts allowed after the first schema-invalid response
    #[serde(default = "default_extraction_retries")]
    pub max_retries: u32,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_retries: default_extraction_retries(),
        }
    }
}

/// Resolution cascade thresholds
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResolverConfig {
    #[serde(default = "default_fulltext_threshold")]
    pub fulltext_threshold: f64,

    #[serde(default = "default_fulltext_weak_floor")]
    pub fulltext_weak_floor: f64,

    #[serde(default = "default_trigram_threshold")]
    pub trigram_threshold: f64,

    #[serde(default = "default_trigram_weak_floor")]
    pub trigram_weak_floor: f64,

    #[serde(default = "default_semantic_max_distance")]
    pub semantic_max_distance: f64,

    #[serde(default = "default_semantic_weak_distance")]
    pub semantic_weak_distance: f64,

    /// Runner-up within this margin of the top score counts as a tie
    #[serde(default = "default_near_tie_margin")]
    pub near_tie_margin: f64,

    #[serde(default = "default_disambiguation_top_k")]
    pub disambiguation_top_k: usize,

    #[serde(default = "default_resolver_concurrency")]
    pub max_concurrency: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            fulltext_threshold: default_fulltext_threshold(),
            fulltext_weak_floor: default_fulltext_weak_floor(),
            trigram_threshold: default_trigram_threshold(),
            trigram_weak_floor: default_trigram_weak_floor(),
            semantic_max_distance: default_semantic_max_distance(),
            semantic_weak_distance: default_semantic_weak_distance(),
            near_tie_margin: default_near_tie_margin(),
            disambiguation_top_k: default_disambiguation_top_k(),
            max_concurrency: default_resolver_concurrency(),
        }
    }
}

/// Semantic index configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_dimensions")]
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimensions: default_embedding_dimensions(),
        }
    }
}

// Default value functions
fn default_data_root() -> PathBuf {
    dirs::data_local_dir()
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local/share")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_database_path() -> PathBuf {
    default_data_root().join("setlog").join("setlog.db")
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_max_connections() -> u32 {
    4
}

fn default_llm_base_url() -> String {
    "http://localhost:11434/v1".into()
}

fn default_llm_model() -> String {
    "qwen2.5:14b-instruct".into()
}

fn default_api_key_env() -> String {
    "SETLOG_LLM_API_KEY".into()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_max_tokens() -> Option<u32> {
    Some(2048)
}

fn default_confidence_threshold() -> f64 {
    DEFAULT_CONFIDENCE_THRESHOLD
}

fn default_max_input_chars() -> usize {
    8_000
}

fn default_extraction_retries() -> u32 {
    DEFAULT_EXTRACTION_RETRIES
}

fn default_fulltext_threshold() -> f64 {
    DEFAULT_FULLTEXT_THRESHOLD
}

fn default_fulltext_weak_floor() -> f64 {
    0.25
}

fn default_trigram_threshold() -> f64 {
    DEFAULT_TRIGRAM_THRESHOLD
}

fn default_trigram_weak_floor() -> f64 {
    0.2
}

fn default_semantic_max_distance() -> f64 {
    DEFAULT_SEMANTIC_MAX_DISTANCE
}

fn default_semantic_weak_distance() -> f64 {
    0.5
}

fn default_near_tie_margin() -> f64 {
    0.05
}

fn default_disambiguation_top_k() -> usize {
    5
}

fn default_resolver_concurrency() -> usize {
    4
}

fn default_embedding_dimensions() -> usize {
    crate::embedding::DEFAULT_EMBEDDING_DIM
}

impl Config {
    /// Load configuration from the standard config path
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            tracing::info!(
                "No config file found at {:?}, using defaults",
                config_path
            );
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        tracing::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        let base = dirs::config_dir()
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))
            .unwrap_or_else(|| PathBuf::from("."));
        base.join("setlog").join("config.toml")
    }

    /// Save the configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, contents)?;
        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Reject values the pipeline cannot operate with
    pub fn validate(&self) -> Result<()> {
        let unit_interval = [
            ("validation.confidence_threshold", self.validation.confidence_threshold),
            ("resolver.fulltext_threshold", self.resolver.fulltext_threshold),
            ("resolver.fulltext_weak_floor", self.resolver.fulltext_weak_floor),
            ("resolver.trigram_threshold", self.resolver.trigram_threshold),
            ("resolver.trigram_weak_floor", self.resolver.trigram_weak_floor),
            ("resolver.near_tie_margin", self.resolver.near_tie_margin),
        ];
        for (key, value) in unit_interval {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!("{key} must be within 0..=1, got {value}")));
            }
        }

        for (key, value) in [
            ("resolver.semantic_max_distance", self.resolver.semantic_max_distance),
            ("resolver.semantic_weak_distance", self.resolver.semantic_weak_distance),
        ] {
            if !(0.0..=2.0).contains(&value) {
                return Err(Error::Config(format!("{key} must be within 0..=2, got {value}")));
            }
        }

        if self.resolver.max_concurrency == 0 {
            return Err(Error::Config("resolver.max_concurrency must be at least 1".into()));
        }
        if self.embedding.dimensions == 0 {
            return Err(Error::Config("embedding.dimensions must be at least 1".into()));
        }
        if self.llm.timeout_secs == 0 {
            return Err(Error::Config("llm.timeout_secs must be at least 1".into()));
        }
        Ok(())
    }
}
