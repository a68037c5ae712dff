use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Script family of the indexed corpus, used to detect cross-lingual questions.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorpusScript {
    #[default]
    Latin,
    Cjk,
    Cyrillic,
    Devanagari,
    Arabic,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Each channel fetches `k * overfetch_factor` raw hits.
    pub overfetch_factor: usize,
    pub conceptual_weight: f32,
    pub literal_weight: f32,
    pub cross_lingual_weight: f32,
    pub corpus_script: CorpusScript,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: 2,
            conceptual_weight: 0.7,
            literal_weight: 0.3,
            cross_lingual_weight: 0.4,
            corpus_script: CorpusScript::Latin,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RerankConfig {
    /// Candidates whose reranked relevance falls below this floor are dropped.
    pub min_relevance: f32,
    /// Share of the retrieval score kept in the reranked relevance.
    pub retrieval_blend: f32,
    /// Cosine similarity above which two chunks of one document are duplicates.
    pub dedup_threshold: f32,
    pub mmr_enabled: bool,
    pub mmr_lambda: f32,
    pub max_chunks_per_page: usize,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            min_relevance: 0.05,
            retrieval_blend: 0.3,
            dedup_threshold: 0.95,
            mmr_enabled: true,
            mmr_lambda: 0.35,
            max_chunks_per_page: 3,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct PlannerConfig {
    pub max_sub_queries: usize,
    /// Questions longer than this many words are never treated as simple.
    pub simple_max_words: usize,
    pub per_sub_query_k: usize,
    pub total_candidate_budget: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            max_sub_queries: 4,
            simple_max_words: 12,
            per_sub_query_k: 10,
            total_candidate_budget: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Upper bound on concurrently running sub-query tasks.
    pub worker_cap: usize,
    pub sub_query_timeout_ms: u64,
    /// Whole-query deadline. Zero disables it.
    pub query_deadline_ms: u64,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            worker_cap: 4,
            sub_query_timeout_ms: 2_000,
            query_deadline_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct CitationConfig {
    pub snippet_chars: usize,
}

impl Default for CitationConfig {
    fn default() -> Self {
        Self { snippet_chars: 240 }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct DocumentMapConfig {
    /// Directory holding `docmap_*.rkyv` snapshots. Unset disables hot reload.
    pub snapshot_dir: Option<String>,
    pub refresh_interval_ms: u64,
}

impl Default for DocumentMapConfig {
    fn default() -> Self {
        Self {
            snapshot_dir: None,
            refresh_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub planner: PlannerConfig,
    pub concurrency: ConcurrencyConfig,
    pub citation: CitationConfig,
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub engine: EngineConfig,
    pub document_map: DocumentMapConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        tracing::debug!(%run_mode, "loading configuration");

        let builder = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            .add_source(Environment::with_prefix("PAGECITE").separator("__"));

        builder.build()?.try_deserialize()
    }

    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(raw, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
