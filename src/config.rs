use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::provider::ProviderId;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub data: DataConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DataConfig {
    pub csv_path: PathBuf,
    #[serde(default = "default_delimiter")]
    pub delimiter: String,
}

fn default_delimiter() -> String {
    ",".to_string()
}

impl DataConfig {
    /// Delimiter as a single byte; validated by [`load_config`].
    pub fn delimiter_byte(&self) -> u8 {
        self.delimiter.as_bytes().first().copied().unwrap_or(b',')
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Cosine similarity the nearest neighbor must exceed to count as a match.
    #[serde(default)]
    pub min_score: f32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            min_score: 0.0,
        }
    }
}

fn default_top_k() -> usize {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Base URL for the Ollama provider.
    #[serde(default)]
    pub url: Option<String>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "disabled".to_string(),
            model: None,
            dims: None,
            batch_size: 64,
            max_retries: 5,
            timeout_secs: 30,
            url: None,
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    /// Backend activated at startup when no choice has been persisted.
    #[serde(default)]
    pub default_backend: Option<String>,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_chat_max_tokens")]
    pub chat_max_tokens: u32,
    #[serde(default = "BackendConfig::openai")]
    pub openai: BackendConfig,
    #[serde(default = "BackendConfig::huggingface")]
    pub huggingface: BackendConfig,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            default_backend: None,
            state_path: default_state_path(),
            timeout_secs: default_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            chat_max_tokens: default_chat_max_tokens(),
            openai: BackendConfig::openai(),
            huggingface: BackendConfig::huggingface(),
        }
    }
}

fn default_state_path() -> PathBuf {
    PathBuf::from("./data/llm_backend.json")
}
fn default_temperature() -> f32 {
    0.7
}
fn default_max_tokens() -> u32 {
    1500
}
fn default_chat_max_tokens() -> u32 {
    500
}

impl GenerationConfig {
    pub fn backend(&self, id: ProviderId) -> &BackendConfig {
        match id {
            ProviderId::OpenAi => &self.openai,
            ProviderId::HuggingFace => &self.huggingface,
        }
    }
}

/// Endpoint settings for one generation backend.
#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    pub model: String,
    /// Base of the OpenAI-compatible API (`{base_url}/chat/completions`).
    pub base_url: String,
    /// URL probed by credential validation.
    pub probe_url: String,
}

impl BackendConfig {
    fn openai() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            probe_url: "https://api.openai.com/v1/models".to_string(),
        }
    }

    fn huggingface() -> Self {
        Self {
            model: "mistralai/Mistral-7B-Instruct-v0.2".to_string(),
            base_url: "https://router.huggingface.co/v1".to_string(),
            probe_url: "https://huggingface.co/api/whoami-v2".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parse and validate a configuration document.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate data
    if config.data.delimiter.len() != 1 || !config.data.delimiter.is_ascii() {
        anyhow::bail!(
            "data.delimiter must be a single ASCII character, got '{}'",
            config.data.delimiter
        );
    }

    // Validate retrieval
    if config.retrieval.top_k < 1 {
        anyhow::bail!("retrieval.top_k must be >= 1");
    }
    if !(-1.0..1.0).contains(&config.retrieval.min_score) {
        anyhow::bail!("retrieval.min_score must be in [-1.0, 1.0)");
    }

    // Validate embedding
    if config.embedding.is_enabled() {
        if config.embedding.dims.is_none() || config.embedding.dims == Some(0) {
            anyhow::bail!(
                "embedding.dims must be > 0 when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.model.is_none() {
            anyhow::bail!(
                "embedding.model must be specified when provider is '{}'",
                config.embedding.provider
            );
        }
        if config.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be > 0");
        }
    }

    match config.embedding.provider.as_str() {
        "disabled" | "openai" | "ollama" | "local" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be disabled, openai, ollama, or local.",
            other
        ),
    }

    // Validate generation
    if let Some(backend) = &config.generation.default_backend {
        backend
            .parse::<ProviderId>()
            .map_err(|e| anyhow::anyhow!("generation.default_backend: {}", e))?;
    }
    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }
    if config.generation.timeout_secs == 0 {
        anyhow::bail!("generation.timeout_secs must be > 0");
    }

    Ok(config)
}
