//! Typed pipeline configuration
//!
//! Loaded from `.filinglens/config.toml`. Every section rejects unknown keys
//! so a typo fails loudly at load time instead of silently falling back to a
//! default.

use crate::error::{PipelineError, Result};
use crate::retrieve::KNOWN_INTENTS;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Directory holding the database, config and build artifacts
pub const WORKSPACE_DIR: &str = ".filinglens";
pub const CONFIG_FILE: &str = "config.toml";
pub const DATABASE_FILE: &str = "filinglens.db";

/// Name of the scope built from the top-level `ticker_set`
pub const DEFAULT_SCOPE: &str = "default";

/// Top-level pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    /// Tickers of the default scope
    #[serde(default = "default_ticker_set")]
    pub ticker_set: Vec<String>,

    /// Corpus root, relative to the workspace root unless absolute
    #[serde(default = "default_corpus_dir")]
    pub corpus_dir: String,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub assembly: AssemblyConfig,

    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    /// Named analysis scopes (e.g. `core`, `validation`)
    #[serde(default)]
    pub scopes: BTreeMap<String, ScopeConfig>,
}

/// Chunker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChunkingConfig {
    /// Hard ceiling on `char_end - char_start`
    #[serde(default = "default_max_chunk_length")]
    pub max_chunk_length: usize,

    /// Characters shared by adjacent chunks
    #[serde(default = "default_overlap")]
    pub overlap: usize,

    /// Documents at or below this length always become a single chunk
    #[serde(default = "default_min_chunk_length")]
    pub min_chunk_length: usize,
}

/// Which embedding backend to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingProviderKind {
    /// Deterministic feature hashing, no network
    Hash,
    Ollama,
    Openai,
}

/// Embedding backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_provider")]
    pub provider: EmbeddingProviderKind,

    /// Identifier stored alongside every vector
    #[serde(default = "default_embedding_model")]
    pub model_id: String,

    /// Backend base URL (ignored by the hash provider)
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Environment variable holding the API key, if any
    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_dimension")]
    pub dimension: usize,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Concurrent batches in flight
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
}

/// Retrieval and re-ranking settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrievalConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Intent labels expanded for every ticker in a build
    #[serde(default = "default_intents")]
    pub intents: Vec<String>,

    #[serde(default = "default_keyword_weight")]
    pub keyword_weight: f64,

    #[serde(default = "default_recency_weight")]
    pub recency_weight: f64,

    #[serde(default = "default_recency_half_life_days")]
    pub recency_half_life_days: f64,

    /// Tickers retrieved concurrently
    #[serde(default = "default_retrieval_concurrency")]
    pub concurrency: usize,
}

/// Context assembly settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssemblyConfig {
    /// Character budget per intent section
    #[serde(default = "default_budget_chars")]
    pub budget_chars: usize,

    /// Smallest passage worth keeping when the best chunk must be truncated
    #[serde(default = "default_min_passage_chars")]
    pub min_passage_chars: usize,
}

/// Which generation backend to talk to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationProviderKind {
    /// No generator; the generate stage is skipped
    None,
    Ollama,
    Openai,
}

/// What to do with an intent whose assembled context is empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoDataPolicy {
    /// Leave the section out of generation and mark it in the report
    SkipSection,
    /// Generate from structured financial metrics only, labelled ungrounded
    MetricsOnly,
    /// Let the generator answer without passages (needs `allow_ungrounded`)
    Ungrounded,
}

/// Generation backend settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GenerationConfig {
    #[serde(default = "default_generation_provider")]
    pub provider: GenerationProviderKind,

    #[serde(default)]
    pub endpoint: Option<String>,

    #[serde(default = "default_generation_model")]
    pub model: String,

    #[serde(default)]
    pub api_key_env: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_generation_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_no_data_policy")]
    pub no_data_policy: NoDataPolicy,

    /// Compliance switch; ungrounded generation is refused unless set
    #[serde(default)]
    pub allow_ungrounded: bool,
}

/// Timeout and retry policy shared by all backend calls
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

/// A named set of tickers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScopeConfig {
    pub ticker_set: Vec<String>,
}

fn default_ticker_set() -> Vec<String> {
    Vec::new()
}

fn default_corpus_dir() -> String {
    "corpus".to_string()
}

fn default_max_chunk_length() -> usize {
    2000
}

fn default_overlap() -> usize {
    200
}

fn default_min_chunk_length() -> usize {
    200
}

fn default_embedding_provider() -> EmbeddingProviderKind {
    EmbeddingProviderKind::Hash
}

fn default_embedding_model() -> String {
    "hash-256".to_string()
}

fn default_dimension() -> usize {
    256
}

fn default_batch_size() -> usize {
    16
}

fn default_embed_concurrency() -> usize {
    4
}

fn default_top_k() -> usize {
    8
}

fn default_intents() -> Vec<String> {
    KNOWN_INTENTS.iter().map(|s| s.to_string()).collect()
}

fn default_keyword_weight() -> f64 {
    0.15
}

fn default_recency_weight() -> f64 {
    0.1
}

fn default_recency_half_life_days() -> f64 {
    365.0
}

fn default_retrieval_concurrency() -> usize {
    4
}

fn default_budget_chars() -> usize {
    6000
}

fn default_min_passage_chars() -> usize {
    200
}

fn default_generation_provider() -> GenerationProviderKind {
    GenerationProviderKind::None
}

fn default_generation_model() -> String {
    "llama3".to_string()
}

fn default_max_tokens() -> usize {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

fn default_generation_concurrency() -> usize {
    2
}

fn default_no_data_policy() -> NoDataPolicy {
    NoDataPolicy::SkipSection
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    8000
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_length: default_max_chunk_length(),
            overlap: default_overlap(),
            min_chunk_length: default_min_chunk_length(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            model_id: default_embedding_model(),
            endpoint: None,
            api_key_env: None,
            dimension: default_dimension(),
            batch_size: default_batch_size(),
            concurrency: default_embed_concurrency(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            intents: default_intents(),
            keyword_weight: default_keyword_weight(),
            recency_weight: default_recency_weight(),
            recency_half_life_days: default_recency_half_life_days(),
            concurrency: default_retrieval_concurrency(),
        }
    }
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            budget_chars: default_budget_chars(),
            min_passage_chars: default_min_passage_chars(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_generation_provider(),
            endpoint: None,
            model: default_generation_model(),
            api_key_env: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            concurrency: default_generation_concurrency(),
            no_data_policy: default_no_data_policy(),
            allow_ungrounded: false,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ticker_set: default_ticker_set(),
            corpus_dir: default_corpus_dir(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            retrieval: RetrievalConfig::default(),
            assembly: AssemblyConfig::default(),
            generation: GenerationConfig::default(),
            backend: BackendConfig::default(),
            scopes: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PipelineConfig {
    /// Load configuration from the workspace or return defaults
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(WORKSPACE_DIR).join(CONFIG_FILE);

        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)
        } else {
            Ok(Self::default())
        }
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: PipelineConfig =
            toml::from_str(content).map_err(|e| PipelineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the workspace
    pub fn save(&self, root: &Path) -> Result<()> {
        let dir = root.join(WORKSPACE_DIR);
        std::fs::create_dir_all(&dir)?;

        let content =
            toml::to_string_pretty(self).map_err(|e| PipelineError::Config(e.to_string()))?;
        std::fs::write(dir.join(CONFIG_FILE), content)?;

        Ok(())
    }

    /// Reject configurations the pipeline cannot honour
    pub fn validate(&self) -> Result<()> {
        let chunking = &self.chunking;
        if chunking.max_chunk_length == 0 {
            return Err(invalid("chunking.max_chunk_length must be positive"));
        }
        if chunking.overlap >= chunking.max_chunk_length {
            return Err(invalid(format!(
                "chunking.overlap ({}) must be smaller than max_chunk_length ({})",
                chunking.overlap, chunking.max_chunk_length
            )));
        }
        if chunking.min_chunk_length > chunking.max_chunk_length {
            return Err(invalid(
                "chunking.min_chunk_length must not exceed max_chunk_length",
            ));
        }

        let embedding = &self.embedding;
        if embedding.model_id.trim().is_empty() {
            return Err(invalid("embedding.model_id must not be empty"));
        }
        if embedding.dimension == 0 || embedding.batch_size == 0 || embedding.concurrency == 0 {
            return Err(invalid(
                "embedding.dimension, batch_size and concurrency must be positive",
            ));
        }
        if embedding.provider != EmbeddingProviderKind::Hash && embedding.endpoint.is_none() {
            return Err(invalid("embedding.endpoint is required for network providers"));
        }

        let retrieval = &self.retrieval;
        if retrieval.top_k == 0 || retrieval.concurrency == 0 {
            return Err(invalid("retrieval.top_k and concurrency must be positive"));
        }
        let non_negative = |w: f64| w.is_finite() && w >= 0.0;
        if !non_negative(retrieval.keyword_weight) || !non_negative(retrieval.recency_weight) {
            return Err(invalid("retrieval weights must be finite and non-negative"));
        }
        if !(retrieval.recency_half_life_days.is_finite() && retrieval.recency_half_life_days > 0.0) {
            return Err(invalid("retrieval.recency_half_life_days must be positive"));
        }
        if retrieval.intents.is_empty() {
            return Err(invalid("retrieval.intents must name at least one intent"));
        }
        for intent in &retrieval.intents {
            if !KNOWN_INTENTS.contains(&intent.as_str()) {
                return Err(invalid(format!(
                    "unknown intent '{}' (known: {})",
                    intent,
                    KNOWN_INTENTS.join(", ")
                )));
            }
        }

        if self.assembly.budget_chars == 0 {
            return Err(invalid("assembly.budget_chars must be positive"));
        }

        let generation = &self.generation;
        if generation.concurrency == 0 {
            return Err(invalid("generation.concurrency must be positive"));
        }
        // ollama falls back to its local default endpoint
        if generation.provider == GenerationProviderKind::Openai && generation.endpoint.is_none() {
            return Err(invalid("generation.endpoint is required for the openai provider"));
        }
        if generation.no_data_policy == NoDataPolicy::Ungrounded && !generation.allow_ungrounded {
            return Err(invalid(
                "generation.no_data_policy = \"ungrounded\" requires allow_ungrounded = true",
            ));
        }

        for ticker in &self.ticker_set {
            validate_ticker(ticker)?;
        }
        for (name, scope) in &self.scopes {
            if name == DEFAULT_SCOPE {
                return Err(invalid(format!(
                    "scope name '{}' is reserved for the top-level ticker_set",
                    DEFAULT_SCOPE
                )));
            }
            for ticker in &scope.ticker_set {
                validate_ticker(ticker)?;
            }
        }

        Ok(())
    }

    /// Resolve a named scope to its ticker set
    pub fn scope_tickers(&self, scope: &str) -> Result<Vec<String>> {
        let tickers = if scope == DEFAULT_SCOPE {
            self.ticker_set.clone()
        } else {
            self.scopes
                .get(scope)
                .map(|s| s.ticker_set.clone())
                .ok_or_else(|| invalid(format!("unknown scope '{}'", scope)))?
        };

        if tickers.is_empty() {
            return Err(invalid(format!("scope '{}' has no tickers", scope)));
        }

        Ok(tickers)
    }

    /// Corpus directory resolved against the workspace root
    pub fn corpus_path(&self, root: &Path) -> std::path::PathBuf {
        let dir = Path::new(&self.corpus_dir);
        if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            root.join(dir)
        }
    }

    /// Stable hash of the effective configuration
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        crate::corpus::content_hash(&canonical)
    }
}

/// Tickers are 1-10 chars of uppercase ASCII letters, digits, '.' or '-'
pub fn validate_ticker(ticker: &str) -> Result<()> {
    let ok = !ticker.is_empty()
        && ticker.len() <= 10
        && ticker
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '.' || c == '-');

    if ok {
        Ok(())
    } else {
        Err(invalid(format!("invalid ticker '{}'", ticker)))
    }
}

fn invalid(msg: impl Into<String>) -> PipelineError {
    PipelineError::Config(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chunking.max_chunk_length, 2000);
        assert_eq!(config.chunking.overlap, 200);
        assert_eq!(config.retrieval.intents.len(), KNOWN_INTENTS.len());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let err = PipelineConfig::from_toml("ticker_set = [\"ACME\"]\ntop_kk = 3\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));

        let err = PipelineConfig::from_toml("[chunking]\nmax_len = 10\n").unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn test_partial_sections_take_defaults() {
        let config = PipelineConfig::from_toml(
            r#"
ticker_set = ["ACME", "BRK.B"]

[chunking]
max_chunk_length = 1000
overlap = 100

[scopes.validation]
ticker_set = ["ZETA"]
"#,
        )
        .unwrap();

        assert_eq!(config.chunking.max_chunk_length, 1000);
        assert_eq!(config.chunking.min_chunk_length, 200);
        assert_eq!(config.retrieval.top_k, 8);
        assert_eq!(config.scope_tickers("validation").unwrap(), vec!["ZETA"]);
        assert_eq!(config.scope_tickers(DEFAULT_SCOPE).unwrap().len(), 2);
        assert!(config.scope_tickers("missing").is_err());
    }

    #[test]
    fn test_overlap_must_be_below_max() {
        let err = PipelineConfig::from_toml("[chunking]\nmax_chunk_length = 100\noverlap = 100\n")
            .unwrap_err();
        assert!(err.to_string().contains("overlap"));
    }

    #[test]
    fn test_unknown_intent_rejected() {
        let err = PipelineConfig::from_toml("[retrieval]\nintents = [\"astrology\"]\n").unwrap_err();
        assert!(err.to_string().contains("astrology"));
    }

    #[test]
    fn test_ungrounded_requires_compliance_flag() {
        let err = PipelineConfig::from_toml("[generation]\nno_data_policy = \"ungrounded\"\n")
            .unwrap_err();
        assert!(err.to_string().contains("allow_ungrounded"));

        PipelineConfig::from_toml(
            "[generation]\nno_data_policy = \"ungrounded\"\nallow_ungrounded = true\n",
        )
        .unwrap();
    }

    #[test]
    fn test_non_finite_retrieval_numbers_rejected() {
        for toml in [
            "[retrieval]\nrecency_half_life_days = nan\n",
            "[retrieval]\nrecency_half_life_days = inf\n",
            "[retrieval]\nrecency_half_life_days = 0.0\n",
            "[retrieval]\nkeyword_weight = nan\n",
        ] {
            let err = PipelineConfig::from_toml(toml).unwrap_err();
            assert!(matches!(err, PipelineError::Config(_)), "{}", toml);
        }
    }

    #[test]
    fn test_generation_endpoint_defaults_for_ollama_only() {
        let config = PipelineConfig::from_toml("[generation]\nprovider = \"ollama\"\n").unwrap();
        assert!(config.generation.endpoint.is_none());

        let err = PipelineConfig::from_toml("[generation]\nprovider = \"openai\"\n").unwrap_err();
        assert!(err.to_string().contains("openai"));
    }

    #[test]
    fn test_ticker_validation() {
        assert!(validate_ticker("ACME").is_ok());
        assert!(validate_ticker("BRK.B").is_ok());
        assert!(validate_ticker("acme").is_err());
        assert!(validate_ticker("").is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PipelineConfig::default();
        config.ticker_set = vec!["ACME".to_string()];
        config.save(dir.path()).unwrap();

        let loaded = PipelineConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.fingerprint(), config.fingerprint());
    }
}
