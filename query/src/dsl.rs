use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_K: usize = 5;
const MAX_K: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    Semantic,
    Keyword,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueryRequest {
    pub question: String,
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default)]
    pub search_mode: SearchMode,
    /// Overrides the query-class weight when present.
    #[serde(default)]
    pub semantic_weight: Option<f32>,
    #[serde(default = "default_decompose")]
    pub decompose: bool,
    /// Restrict retrieval to these document ids.
    #[serde(default)]
    pub document_filter: Option<Vec<String>>,
}

const fn default_k() -> usize {
    DEFAULT_K
}

const fn default_decompose() -> bool {
    true
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum QueryValidationError {
    #[error("question must not be empty")]
    EmptyQuestion,
    #[error("k must be between 1 and {0}")]
    InvalidK(usize),
    #[error("semantic_weight must be within [0, 1], got {0}")]
    InvalidSemanticWeight(f32),
    #[error("document_filter must not contain empty values")]
    InvalidDocumentFilter,
}

impl QueryRequest {
    pub fn new(question: impl Into<String>) -> Self {
        Self {
            question: question.into(),
            k: DEFAULT_K,
            search_mode: SearchMode::default(),
            semantic_weight: None,
            decompose: true,
            document_filter: None,
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn with_search_mode(mut self, search_mode: SearchMode) -> Self {
        self.search_mode = search_mode;
        self
    }

    pub fn with_semantic_weight(mut self, weight: f32) -> Self {
        self.semantic_weight = Some(weight);
        self
    }

    pub fn without_decomposition(mut self) -> Self {
        self.decompose = false;
        self
    }

    pub fn with_document_filter<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.document_filter = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn parse_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn validate(&self) -> Result<(), QueryValidationError> {
        if self.question.trim().is_empty() {
            return Err(QueryValidationError::EmptyQuestion);
        }
        if self.k == 0 || self.k > MAX_K {
            return Err(QueryValidationError::InvalidK(MAX_K));
        }
        if let Some(weight) = self.semantic_weight {
            if !(0.0..=1.0).contains(&weight) {
                return Err(QueryValidationError::InvalidSemanticWeight(weight));
            }
        }
        if let Some(filter) = &self.document_filter {
            if filter.iter().any(|id| id.trim().is_empty()) {
                return Err(QueryValidationError::InvalidDocumentFilter);
            }
        }
        Ok(())
    }
}
