//! Second-pass relevance scoring, near-duplicate removal and MMR diversity.

use crate::retriever::{by_similarity, Candidate};
use async_trait::async_trait;
use pagecite_core::config::RerankConfig;
use pagecite_core::embedding::cosine_similarity;
use pagecite_core::text::{query_terms, tokenize};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, warn};

const COVERAGE_WEIGHT: f32 = 0.7;
const PHRASE_WEIGHT: f32 = 0.3;

/// Pairwise query/passage relevance model.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// Relevance of `passage` to `query` in `[0, 1]`.
    async fn score(&self, query: &str, passage: &str) -> anyhow::Result<f32>;
}

/// Query-term coverage blended with adjacent-term (phrase) matches.
#[derive(Debug, Clone, Copy, Default)]
pub struct LexicalRelevanceScorer;

impl LexicalRelevanceScorer {
    pub fn score_text(query: &str, passage: &str) -> f32 {
        let query_terms = query_terms(query);
        if query_terms.is_empty() {
            return 0.0;
        }
        let passage_terms = tokenize(passage);
        let covered = query_terms
            .iter()
            .filter(|term| passage_terms.contains(*term))
            .count();
        let coverage = covered as f32 / query_terms.len() as f32;

        if query_terms.len() < 2 {
            return coverage;
        }
        let passage_pairs = word_pairs(passage);
        let query_pairs = word_pairs(query);
        let phrase = if query_pairs.is_empty() {
            coverage
        } else {
            query_pairs.iter().filter(|pair| passage_pairs.contains(*pair)).count() as f32
                / query_pairs.len() as f32
        };

        COVERAGE_WEIGHT * coverage + PHRASE_WEIGHT * phrase
    }
}

#[async_trait]
impl RelevanceScorer for LexicalRelevanceScorer {
    async fn score(&self, query: &str, passage: &str) -> anyhow::Result<f32> {
        Ok(Self::score_text(query, passage))
    }
}

fn word_pairs(text: &str) -> HashSet<(String, String)> {
    let words = query_terms(text);
    words
        .windows(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect()
}

pub struct Reranker {
    scorer: Arc<dyn RelevanceScorer>,
    config: RerankConfig,
}

impl Reranker {
    pub fn new(scorer: Arc<dyn RelevanceScorer>, config: RerankConfig) -> Self {
        Self { scorer, config }
    }

    pub fn lexical(config: RerankConfig) -> Self {
        Self::new(Arc::new(LexicalRelevanceScorer), config)
    }

    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    /// Rerank against `query`, drop near-duplicates and keep at most `max_out`.
    pub async fn refine(&self, candidates: Vec<Candidate>, query: &str, max_out: usize) -> Vec<Candidate> {
        let reranked = self.rerank(candidates, query).await;
        let unique = self.deduplicate(reranked);
        self.diversify(unique, max_out)
    }

    /// Score every candidate against `query`, drop those under the relevance
    /// floor and sort by similarity. A scorer failure keeps the retrieval score.
    pub async fn rerank(&self, mut candidates: Vec<Candidate>, query: &str) -> Vec<Candidate> {
        let blend = self.config.retrieval_blend.clamp(0.0, 1.0);
        for candidate in &mut candidates {
            match self.scorer.score(query, &candidate.chunk.text).await {
                Ok(score) if score.is_finite() => {
                    let score = score.clamp(0.0, 1.0);
                    candidate.rerank_score =
                        Some((1.0 - blend) * score + blend * candidate.raw_score);
                }
                Ok(score) => {
                    warn!(chunk_id = candidate.id(), score, "non-finite relevance score ignored");
                }
                Err(err) => {
                    warn!(chunk_id = candidate.id(), error = %err, "relevance scorer failed, keeping retrieval score");
                }
            }
        }

        let before = candidates.len();
        candidates.retain(|candidate| {
            candidate
                .rerank_score
                .map_or(true, |score| score >= self.config.min_relevance)
        });
        if candidates.len() < before {
            debug!(dropped = before - candidates.len(), "candidates below relevance floor");
        }

        candidates.sort_by(by_similarity);
        candidates
    }

    /// Keep the best-scoring copy of every chunk id and drop chunks whose
    /// embedding is too close to an already kept chunk of the same document.
    pub fn deduplicate(&self, mut candidates: Vec<Candidate>) -> Vec<Candidate> {
        candidates.sort_by(by_similarity);
        let mut seen_ids = HashSet::new();
        let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if !seen_ids.insert(candidate.id()) {
                continue;
            }
            let duplicate_of = kept.iter().find(|existing| {
                existing.chunk.document_id == candidate.chunk.document_id
                    && cosine_similarity(&existing.chunk.embedding, &candidate.chunk.embedding)
                        .is_some_and(|sim| sim > self.config.dedup_threshold)
            });
            if let Some(existing) = duplicate_of {
                debug!(chunk_id = candidate.id(), kept = existing.id(), "near-duplicate dropped");
                continue;
            }
            kept.push(candidate);
        }
        kept
    }

    /// MMR selection of up to `max_out` candidates when enabled, else the top `max_out`.
    pub fn diversify(&self, mut candidates: Vec<Candidate>, max_out: usize) -> Vec<Candidate> {
        if !self.config.mmr_enabled {
            candidates.sort_by(by_similarity);
            candidates.truncate(max_out);
            return candidates;
        }
        mmr_select(candidates, max_out, self.config.mmr_lambda)
    }
}

/// Maximal marginal relevance over min-max normalized similarity. Returns the
/// selected candidates in selection order.
pub fn mmr_select(mut candidates: Vec<Candidate>, max_out: usize, lambda: f32) -> Vec<Candidate> {
    candidates.sort_by(by_similarity);
    if candidates.len() <= 1 || max_out == 0 {
        candidates.truncate(max_out);
        return candidates;
    }

    let lambda = lambda.clamp(0.0, 1.0);
    let (min, max) = candidates.iter().fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), c| {
        (lo.min(c.similarity()), hi.max(c.similarity()))
    });
    let range = max - min;
    let relevance: Vec<f32> = candidates
        .iter()
        .map(|c| {
            if range > f32::EPSILON {
                (c.similarity() - min) / range
            } else {
                1.0
            }
        })
        .collect();

    let mut remaining: Vec<usize> = (0..candidates.len()).collect();
    let mut selected: Vec<usize> = Vec::with_capacity(max_out.min(candidates.len()));
    // Running max similarity of each candidate to the selected set.
    let mut redundancy = vec![0.0f32; candidates.len()];

    while selected.len() < max_out && !remaining.is_empty() {
        let mut best_pos = 0;
        let mut best_score = f32::NEG_INFINITY;
        for (pos, &idx) in remaining.iter().enumerate() {
            let score = lambda * relevance[idx] - (1.0 - lambda) * redundancy[idx];
            if score > best_score {
                best_score = score;
                best_pos = pos;
            }
        }
        let chosen = remaining.remove(best_pos);
        for &idx in &remaining {
            let sim = cosine_similarity(
                &candidates[chosen].chunk.embedding,
                &candidates[idx].chunk.embedding,
            )
            .unwrap_or(0.0);
            redundancy[idx] = redundancy[idx].max(sim);
        }
        selected.push(chosen);
    }

    let mut slots: Vec<Option<Candidate>> = candidates.into_iter().map(Some).collect();
    selected
        .into_iter()
        .filter_map(|idx| slots[idx].take())
        .collect()
}

/// Keep at most `max_per_key` items per key, preserving order. Zero disables the cap.
pub fn limit_per_key<T, K, F>(items: Vec<T>, max_per_key: usize, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    if max_per_key == 0 {
        return items;
    }
    let mut counts: HashMap<K, usize> = HashMap::new();
    items
        .into_iter()
        .filter(|item| {
            let count = counts.entry(key(item)).or_insert(0);
            *count += 1;
            *count <= max_per_key
        })
        .collect()
}
