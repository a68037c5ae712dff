use crate::dsl::QueryRequest;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use pagecite_core::config::{CorpusScript, PlannerConfig, RetrievalConfig};
use regex::Regex;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Clauses shorter than this stay glued to their neighbour when splitting on a conjunction.
const MIN_CLAUSE_WORDS: usize = 2;

const CONJUNCTIONS: [&str; 7] = ["and", "or", "but", "also", "as well as", "versus", "vs"];

static CONJUNCTION_SPLIT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)[,]?\s+(?:and|or|but|also|as well as|versus|vs\.?)\s+")
        .expect("conjunction regex is valid")
});

static LITERAL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        // email
        r"[\w.+-]+@[\w-]+(?:\.[\w-]+)+",
        // url
        r"(?i)\b(?:https?://|www\.)\S+",
        // phone number
        r"\+?\d[\d\s().-]{6,}\d",
        // quoted string
        r#""[^"]+"|“[^”]+”"#,
        // identifier such as a part number or error code
        r"\b[A-Za-z]{1,10}[-_]?\d{2,}[A-Za-z0-9_-]*\b",
    ]
    .iter()
    .map(|pattern| Regex::new(pattern).expect("literal query regex is valid"))
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryClass {
    Conceptual,
    /// Targets a short literal string such as an email address or part number.
    Literal,
    /// Written in a different script from the corpus.
    CrossLingual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decomposition {
    /// The caller disabled decomposition.
    Disabled,
    /// The question was simple enough to retrieve as is.
    Skipped,
    Decomposed,
    /// The decomposer failed or returned nothing usable.
    FellBack,
}

/// Splits a complex question into narrower sub-queries.
#[async_trait]
pub trait QueryDecomposer: Send + Sync {
    async fn decompose(&self, question: &str, max_sub_queries: usize) -> anyhow::Result<Vec<String>>;
}

/// Splits on question marks, semicolons and coordinating conjunctions.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicDecomposer;

#[async_trait]
impl QueryDecomposer for HeuristicDecomposer {
    async fn decompose(&self, question: &str, max_sub_queries: usize) -> anyhow::Result<Vec<String>> {
        let mut parts = Vec::new();
        for sentence in split_sentences(question) {
            parts.extend(split_conjunctions(&sentence));
        }
        parts.truncate(max_sub_queries);
        Ok(parts)
    }
}

fn split_sentences(question: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in question.chars() {
        match ch {
            '?' | '？' => {
                current.push(ch);
                out.push(std::mem::take(&mut current));
            }
            ';' | '；' => out.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    out.push(current);
    out.into_iter()
        .map(|part| part.trim().to_string())
        .filter(|part| part.chars().any(char::is_alphanumeric))
        .collect()
}

fn split_conjunctions(sentence: &str) -> Vec<String> {
    let mut clauses: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut last = 0;

    for found in CONJUNCTION_SPLIT.find_iter(sentence) {
        current.push_str(&sentence[last..found.start()]);
        let rest_until_next = CONJUNCTION_SPLIT
            .find_at(sentence, found.end())
            .map_or(&sentence[found.end()..], |next| &sentence[found.end()..next.start()]);
        if word_count(&current) >= MIN_CLAUSE_WORDS && word_count(rest_until_next) >= MIN_CLAUSE_WORDS {
            clauses.push(std::mem::take(&mut current));
        } else {
            current.push_str(found.as_str());
        }
        last = found.end();
    }
    current.push_str(&sentence[last..]);
    clauses.push(current);

    clauses
        .into_iter()
        .map(|clause| clause.trim().to_string())
        .filter(|clause| !clause.is_empty())
        .collect()
}

fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub sub_queries: Vec<String>,
    pub decomposition: Decomposition,
    pub query_class: QueryClass,
    pub semantic_weight: f32,
    pub per_sub_query_k: usize,
    pub total_candidate_budget: usize,
    pub steps: Vec<&'static str>,
}

pub struct QueryPlanner {
    decomposer: Arc<dyn QueryDecomposer>,
    planner: PlannerConfig,
    retrieval: RetrievalConfig,
}

impl QueryPlanner {
    pub fn new(
        decomposer: Arc<dyn QueryDecomposer>,
        planner: PlannerConfig,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            decomposer,
            planner,
            retrieval,
        }
    }

    pub fn heuristic(planner: PlannerConfig, retrieval: RetrievalConfig) -> Self {
        Self::new(Arc::new(HeuristicDecomposer), planner, retrieval)
    }

    /// Short, single-clause questions are retrieved without decomposition.
    pub fn is_simple(&self, question: &str) -> bool {
        let normalized = question.to_lowercase();
        let words: Vec<&str> = normalized
            .split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|word| !word.is_empty())
            .collect();

        if words.len() > self.planner.simple_max_words {
            return false;
        }
        if normalized.matches(['?', '？']).count() > 1 || normalized.contains([';', '；']) {
            return false;
        }
        !CONJUNCTIONS.iter().any(|conjunction| {
            let parts: Vec<&str> = conjunction.split(' ').collect();
            words.windows(parts.len()).any(|window| window == parts.as_slice())
        })
    }

    pub async fn plan(&self, question: &str, max_sub_queries: usize) -> Vec<String> {
        self.decompose(question, max_sub_queries).await.0
    }

    pub async fn plan_request(&self, request: &QueryRequest) -> QueryPlan {
        let max_sub_queries = self.planner.max_sub_queries.max(1);
        let (sub_queries, decomposition) = if request.decompose {
            self.decompose(&request.question, max_sub_queries).await
        } else {
            (vec![request.question.trim().to_string()], Decomposition::Disabled)
        };

        let query_class = self.classify(&request.question);
        let semantic_weight = request
            .semantic_weight
            .unwrap_or_else(|| self.weight_for(query_class));

        let mut steps = Vec::with_capacity(8);
        if decomposition == Decomposition::Decomposed {
            steps.push("decompose");
        }
        steps.extend([
            "hybrid_retrieval",
            "rerank",
            "merge",
            "dedup",
            "mmr",
            "page_resolution",
            "citation_ranking",
        ]);

        debug!(
            sub_queries = sub_queries.len(),
            ?decomposition,
            ?query_class,
            semantic_weight,
            "query planned"
        );

        QueryPlan {
            sub_queries,
            decomposition,
            query_class,
            semantic_weight,
            per_sub_query_k: self.planner.per_sub_query_k.max(request.k),
            total_candidate_budget: self.planner.total_candidate_budget.max(request.k),
            steps,
        }
    }

    async fn decompose(&self, question: &str, max_sub_queries: usize) -> (Vec<String>, Decomposition) {
        let question = question.trim();
        if max_sub_queries <= 1 || self.is_simple(question) {
            return (vec![question.to_string()], Decomposition::Skipped);
        }

        match self.decomposer.decompose(question, max_sub_queries).await {
            Ok(parts) => {
                let cleaned = clean_sub_queries(parts, max_sub_queries);
                if cleaned.is_empty() {
                    warn!("decomposer returned no usable sub-queries, using original question");
                    (vec![question.to_string()], Decomposition::FellBack)
                } else {
                    (cleaned, Decomposition::Decomposed)
                }
            }
            Err(err) => {
                warn!(error = %err, "query decomposition failed, using original question");
                (vec![question.to_string()], Decomposition::FellBack)
            }
        }
    }

    pub fn classify(&self, question: &str) -> QueryClass {
        if LITERAL_PATTERNS.iter().any(|pattern| pattern.is_match(question)) {
            return QueryClass::Literal;
        }
        match dominant_script(question) {
            Some(script) if script != self.retrieval.corpus_script => QueryClass::CrossLingual,
            _ => QueryClass::Conceptual,
        }
    }

    pub fn weight_for(&self, class: QueryClass) -> f32 {
        let weight = match class {
            QueryClass::Conceptual => self.retrieval.conceptual_weight,
            QueryClass::Literal => self.retrieval.literal_weight,
            QueryClass::CrossLingual => self.retrieval.cross_lingual_weight,
        };
        weight.clamp(0.0, 1.0)
    }
}

fn clean_sub_queries(parts: Vec<String>, max_sub_queries: usize) -> Vec<String> {
    let mut seen = HashSet::new();
    parts
        .into_iter()
        .map(|part| part.trim().to_string())
        .filter(|part| part.chars().any(char::is_alphanumeric))
        .filter(|part| seen.insert(part.to_lowercase()))
        .take(max_sub_queries)
        .collect()
}

/// Script family holding most of the letters in `text`.
pub fn dominant_script(text: &str) -> Option<CorpusScript> {
    let mut counts = [0usize; 5];
    for ch in text.chars().filter(|c| c.is_alphabetic()) {
        let slot = match u32::from(ch) {
            0x0041..=0x024F | 0x1E00..=0x1EFF => 0,
            0x3040..=0x30FF | 0x3400..=0x4DBF | 0x4E00..=0x9FFF | 0xAC00..=0xD7AF => 1,
            0x0400..=0x04FF => 2,
            0x0900..=0x097F => 3,
            0x0600..=0x06FF => 4,
            _ => continue,
        };
        counts[slot] += 1;
    }

    let (slot, count) = counts
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.cmp(b.1).then(b.0.cmp(&a.0)))?;
    if *count == 0 {
        return None;
    }
    Some(match slot {
        0 => CorpusScript::Latin,
        1 => CorpusScript::Cjk,
        2 => CorpusScript::Cyrillic,
        3 => CorpusScript::Devanagari,
        _ => CorpusScript::Arabic,
    })
}
