use anyhow::Context;
use providers::alphavantage::{AvConfig, DEFAULT_BASE_URL};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub alpha_vantage: AlphaVantageConfig,
    pub embeddings: EmbeddingConfig,
    pub generation: GenerationConfig,
    pub vectors: VectorConfig,
    pub retrieval: RetrievalConfig,
    pub chunking: ChunkingConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "storage/finrag.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlphaVantageConfig {
    pub api_key: String,
    pub base_url: String,
    pub rate_limit_sleep_secs: u64,
    pub max_attempts: u32,
    pub timeout_secs: u64,
}

impl Default for AlphaVantageConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            rate_limit_sleep_secs: 13,
            max_attempts: 5,
            timeout_secs: 30,
        }
    }
}

impl AlphaVantageConfig {
    /// Client settings, with an optional key that overrides the configured one.
    pub fn client_config(&self, api_key: Option<&str>) -> AvConfig {
        AvConfig {
            api_key: api_key.unwrap_or(&self.api_key).to_string(),
            base_url: self.base_url.clone(),
            rate_limit_sleep: Duration::from_secs(self.rate_limit_sleep_secs),
            max_attempts: self.max_attempts.max(1),
            timeout: Duration::from_secs(self.timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hashing` (local), `openai` (any OpenAI-compatible server) or `noop`.
    pub provider: String,
    pub model: String,
    pub batch_size: usize,
    /// Vector width for the local hashing embedder.
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            batch_size: 64,
            dimensions: 384,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptStyle {
    /// Short single-purpose prompts suited to small seq2seq models.
    #[default]
    Compact,
    /// System prompt plus numbered, cited context for chat models.
    Grounded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// `openai` or `noop`; `noop` answers with extraction only.
    pub provider: String,
    pub model: String,
    pub max_new_tokens: u32,
    pub prompt_style: PromptStyle,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "noop".to_string(),
            model: "google/flan-t5-base".to_string(),
            max_new_tokens: 100,
            prompt_style: PromptStyle::Compact,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// `sqlite` (local, default) or `qdrant`.
    pub provider: String,
    pub url: Option<String>,
    pub collection: String,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            provider: "sqlite".to_string(),
            url: None,
            collection: "docs".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Hits returned by plain search.
    pub top_k: usize,
    /// Candidates fetched before answering.
    pub answer_k: usize,
    /// Candidates that make it into the prompt.
    pub prompt_chunks: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 4,
            answer_k: 6,
            prompt_chunks: 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStrategy {
    /// API passages are already small: one chunk per document.
    #[default]
    Identity,
    Window,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub strategy: ChunkStrategy,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            strategy: ChunkStrategy::Identity,
            chunk_size: 600,
            chunk_overlap: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

const LEGACY_STRING_VARS: &[(&str, &str)] = &[
    ("ALPHA_VANTAGE_KEY", "alpha_vantage.api_key"),
    ("EMBEDDING_MODEL", "embeddings.model"),
    ("GENERATION_MODEL", "generation.model"),
];

const LEGACY_NUMERIC_VARS: &[(&str, &str)] = &[
    ("TOP_K", "retrieval.top_k"),
    ("CHUNK_SIZE", "chunking.chunk_size"),
    ("CHUNK_OVERLAP", "chunking.chunk_overlap"),
    ("AV_RATE_LIMIT_SLEEP", "alpha_vantage.rate_limit_sleep_secs"),
];

/// Maps the flat variable names of older deployments onto config keys.
pub fn legacy_overrides(
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Vec<(String, config::Value)>> {
    let mut out = Vec::new();
    for (var, key) in LEGACY_STRING_VARS {
        if let Some(v) = lookup(var).filter(|v| !v.is_empty()) {
            out.push((key.to_string(), config::Value::from(v)));
        }
    }
    for (var, key) in LEGACY_NUMERIC_VARS {
        if let Some(v) = lookup(var).filter(|v| !v.is_empty()) {
            let n: i64 = v
                .trim()
                .parse()
                .with_context(|| format!("{} must be an integer, got {:?}", var, v))?;
            out.push((key.to_string(), config::Value::from(n)));
        }
    }
    if let Some(dir) = lookup("CHROMA_DIR").filter(|v| !v.is_empty()) {
        let path = std::path::Path::new(&dir).join("finrag.db");
        out.push((
            "database.path".to_string(),
            config::Value::from(path.to_string_lossy().into_owned()),
        ));
    }
    Ok(out)
}

pub fn load(path: Option<&str>) -> anyhow::Result<AppConfig> {
    load_with_env(path, std::env::vars().collect())
}

/// Defaults < config file < legacy env names < `FINRAG__SECTION__KEY`.
pub fn load_with_env(
    path: Option<&str>,
    vars: config::Map<String, String>,
) -> anyhow::Result<AppConfig> {
    let mut settings = config::Config::builder();
    if let Some(p) = path {
        settings = settings.add_source(config::File::with_name(p));
    } else {
        settings = settings.add_source(config::File::with_name("config/default").required(false));
    }

    // Legacy names form their own layer so prefixed variables still win.
    let mut legacy = config::Config::builder();
    for (key, value) in legacy_overrides(|var| vars.get(var).cloned())? {
        legacy = legacy.set_override(key, value)?;
    }
    settings = settings.add_source(legacy.build()?);

    settings = settings.add_source(
        config::Environment::with_prefix("FINRAG")
            .separator("__")
            .try_parsing(true)
            .source(Some(vars)),
    );
    let cfg = settings.build()?;
    Ok(cfg.try_deserialize()?)
}
