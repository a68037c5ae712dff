//! Hybrid (semantic + keyword) candidate retrieval.

use crate::dsl::SearchMode;
use pagecite_core::model::{Chunk, ChunkId};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use storage::{document_allowed, ChunkStore, Index, StoreError};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreChannel {
    Semantic,
    Keyword,
    Hybrid,
}

/// A retrieved chunk plus the scores it picked up on the way through the pipeline.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub chunk: Arc<Chunk>,
    /// Combined, normalized retrieval score.
    pub raw_score: f32,
    pub channel: ScoreChannel,
    pub sub_query_index: usize,
    /// Position in its sub-query's retrieval result.
    pub retrieval_rank: usize,
    pub semantic_score: Option<f32>,
    pub keyword_score: Option<f32>,
    pub rerank_score: Option<f32>,
}

impl Candidate {
    pub fn id(&self) -> ChunkId {
        self.chunk.id
    }

    /// Reranked relevance when available, else the retrieval score.
    pub fn similarity(&self) -> f32 {
        self.rerank_score.unwrap_or(self.raw_score)
    }

    /// Trust in the retrieval path that surfaced this chunk.
    pub fn source_confidence(&self) -> f32 {
        match self.channel {
            ScoreChannel::Hybrid => 1.0,
            ScoreChannel::Semantic => 0.75,
            ScoreChannel::Keyword => 0.6,
        }
    }

    /// Original retrieval order across sub-queries: rank first, then sub-query.
    pub fn retrieval_order(&self) -> (usize, usize) {
        (self.retrieval_rank, self.sub_query_index)
    }
}

/// Descending similarity, then retrieval order, then chunk id.
pub(crate) fn by_similarity(a: &Candidate, b: &Candidate) -> Ordering {
    b.similarity()
        .partial_cmp(&a.similarity())
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.retrieval_order().cmp(&b.retrieval_order()))
        .then_with(|| a.id().cmp(&b.id()))
}

#[derive(Debug, Clone)]
pub struct RetrievalQuery<'a> {
    pub embedding: &'a [f32],
    pub terms: &'a [String],
    pub k: usize,
    /// Weight of the semantic channel in `[0, 1]`. Ignored outside hybrid mode.
    pub semantic_weight: f32,
    pub mode: SearchMode,
    pub sub_query_index: usize,
    pub document_filter: Option<&'a [String]>,
}

pub struct HybridRetriever {
    index: Arc<dyn Index>,
    chunks: Arc<dyn ChunkStore>,
    overfetch_factor: usize,
}

impl HybridRetriever {
    pub fn new(index: Arc<dyn Index>, chunks: Arc<dyn ChunkStore>, overfetch_factor: usize) -> Self {
        Self {
            index,
            chunks,
            overfetch_factor: overfetch_factor.max(1),
        }
    }

    pub async fn retrieve(&self, query: &RetrievalQuery<'_>) -> Result<Vec<Candidate>, StoreError> {
        if query.k == 0 {
            return Ok(Vec::new());
        }
        let fetch_k = query.k.saturating_mul(self.overfetch_factor);
        let (use_semantic, use_keyword, weight) = match query.mode {
            SearchMode::Semantic => (true, false, 1.0),
            SearchMode::Keyword => (false, true, 0.0),
            SearchMode::Hybrid => (true, true, query.semantic_weight.clamp(0.0, 1.0)),
        };

        let semantic = async {
            if use_semantic && !query.embedding.is_empty() {
                self.index
                    .semantic_search(query.embedding, fetch_k, query.document_filter)
                    .await
            } else {
                Ok(Vec::new())
            }
        };
        let keyword = async {
            if use_keyword && !query.terms.is_empty() {
                self.index
                    .keyword_search(query.terms, fetch_k, query.document_filter)
                    .await
            } else {
                Ok(Vec::new())
            }
        };
        let (semantic, keyword) = tokio::join!(semantic, keyword);
        let fused = fuse(&normalize(semantic?), &normalize(keyword?), weight);

        debug!(
            sub_query = query.sub_query_index,
            fused = fused.len(),
            k = query.k,
            "hybrid retrieval fused"
        );

        let mut candidates = Vec::with_capacity(query.k);
        for hit in fused {
            if candidates.len() >= query.k {
                break;
            }
            let chunk = match self.chunks.get(hit.id).await {
                Ok(chunk) => chunk,
                Err(StoreError::ChunkNotFound(id)) => {
                    debug!(chunk_id = id, "indexed chunk missing from chunk store, skipped");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if !document_allowed(query.document_filter, &chunk.document_id) {
                debug!(chunk_id = chunk.id, "index returned a chunk outside the document filter, skipped");
                continue;
            }
            candidates.push(Candidate {
                chunk,
                raw_score: hit.combined,
                channel: hit.channel(),
                sub_query_index: query.sub_query_index,
                retrieval_rank: candidates.len(),
                semantic_score: hit.semantic,
                keyword_score: hit.keyword,
                rerank_score: None,
            });
        }
        Ok(candidates)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FusedHit {
    id: ChunkId,
    semantic: Option<f32>,
    keyword: Option<f32>,
    combined: f32,
}

impl FusedHit {
    fn channel(&self) -> ScoreChannel {
        match (self.semantic, self.keyword) {
            (Some(_), Some(_)) => ScoreChannel::Hybrid,
            (None, Some(_)) => ScoreChannel::Keyword,
            _ => ScoreChannel::Semantic,
        }
    }
}

/// Min-max normalize one channel to `[0, 1]`, keeping the max score per chunk id.
/// A channel whose scores are all equal maps to 1.0.
fn normalize(hits: Vec<(ChunkId, f32)>) -> HashMap<ChunkId, f32> {
    let mut best: HashMap<ChunkId, f32> = HashMap::with_capacity(hits.len());
    for (id, score) in hits {
        if !score.is_finite() {
            continue;
        }
        best.entry(id)
            .and_modify(|current| *current = current.max(score))
            .or_insert(score);
    }

    let (min, max) = best
        .values()
        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), s| (lo.min(*s), hi.max(*s)));
    let range = max - min;
    for score in best.values_mut() {
        *score = if range > f32::EPSILON {
            (*score - min) / range
        } else {
            1.0
        };
    }
    best
}

fn fuse(
    semantic: &HashMap<ChunkId, f32>,
    keyword: &HashMap<ChunkId, f32>,
    semantic_weight: f32,
) -> Vec<FusedHit> {
    let mut ids: Vec<ChunkId> = semantic.keys().chain(keyword.keys()).copied().collect();
    ids.sort_unstable();
    ids.dedup();

    let mut fused: Vec<FusedHit> = ids
        .into_iter()
        .map(|id| {
            let semantic = semantic.get(&id).copied();
            let keyword = keyword.get(&id).copied();
            let combined = semantic_weight * semantic.unwrap_or(0.0)
                + (1.0 - semantic_weight) * keyword.unwrap_or(0.0);
            FusedHit {
                id,
                semantic,
                keyword,
                combined,
            }
        })
        .collect();

    fused.sort_by(|a, b| {
        b.combined
            .partial_cmp(&a.combined)
            .unwrap_or(Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
    fused
}

#[cfg(test)]
mod tests {
    use super::*;
    use storage::MemoryCorpus;

    async fn corpus() -> Arc<MemoryCorpus> {
        let corpus = Arc::new(MemoryCorpus::new());
        corpus
            .put_chunks(vec![
                Chunk::new(1, "manual", "battery warranty lasts eight years", vec![1.0, 0.0, 0.0], 0, 36),
                Chunk::new(2, "manual", "contact support@example.com for service", vec![0.0, 1.0, 0.0], 36, 76),
                Chunk::new(3, "brochure", "battery range and charging speed", vec![0.9, 0.1, 0.0], 0, 32),
                Chunk::new(4, "brochure", "interior colors", vec![0.0, 0.0, 1.0], 32, 47),
            ])
            .await;
        corpus
    }

    fn retriever(corpus: Arc<MemoryCorpus>) -> HybridRetriever {
        HybridRetriever::new(corpus.clone(), corpus, 2)
    }

    fn terms(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[test]
    fn normalize_maps_degenerate_channel_to_one() {
        let normalized = normalize(vec![(1, 0.4), (2, 0.4)]);
        assert_eq!(normalized[&1], 1.0);
        assert_eq!(normalized[&2], 1.0);

        let normalized = normalize(vec![(1, 2.0), (2, 1.0), (3, 0.0), (1, 0.5)]);
        assert_eq!(normalized[&1], 1.0);
        assert_eq!(normalized[&2], 0.5);
        assert_eq!(normalized[&3], 0.0);
    }

    #[test]
    fn fuse_blends_channels_and_breaks_ties_by_id() {
        let semantic = HashMap::from([(7, 1.0), (3, 0.0)]);
        let keyword = HashMap::from([(3, 1.0), (5, 1.0)]);

        let fused = fuse(&semantic, &keyword, 0.5);
        let order: Vec<ChunkId> = fused.iter().map(|hit| hit.id).collect();
        assert_eq!(order, vec![3, 5, 7]);
        assert_eq!(fused[0].channel(), ScoreChannel::Hybrid);
        assert_eq!(fused[1].channel(), ScoreChannel::Keyword);
        assert_eq!(fused[2].channel(), ScoreChannel::Semantic);
    }

    #[tokio::test]
    async fn keyword_leaning_weight_surfaces_literal_match() {
        let retriever = retriever(corpus().await);
        let terms = terms(&["support", "example", "com"]);
        let query = RetrievalQuery {
            embedding: &[1.0, 0.0, 0.0],
            terms: &terms,
            k: 2,
            semantic_weight: 0.2,
            mode: SearchMode::Hybrid,
            sub_query_index: 0,
            document_filter: None,
        };

        let candidates = retriever.retrieve(&query).await.unwrap();
        assert_eq!(candidates[0].id(), 2);
        assert_eq!(candidates[0].retrieval_rank, 0);
        assert!(candidates.len() <= 2);
    }

    #[tokio::test]
    async fn semantic_mode_ignores_keyword_channel() {
        let retriever = retriever(corpus().await);
        let terms = terms(&["support"]);
        let query = RetrievalQuery {
            embedding: &[1.0, 0.0, 0.0],
            terms: &terms,
            k: 2,
            semantic_weight: 0.0,
            mode: SearchMode::Semantic,
            sub_query_index: 1,
            document_filter: None,
        };

        let candidates = retriever.retrieve(&query).await.unwrap();
        let ids: Vec<ChunkId> = candidates.iter().map(Candidate::id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert!(candidates.iter().all(|c| c.channel == ScoreChannel::Semantic));
        assert!(candidates.iter().all(|c| c.sub_query_index == 1));
    }

    #[tokio::test]
    async fn document_filter_excludes_other_documents() {
        let retriever = retriever(corpus().await);
        let terms = terms(&["battery"]);
        let filter = vec!["brochure".to_string()];
        let query = RetrievalQuery {
            embedding: &[1.0, 0.0, 0.0],
            terms: &terms,
            k: 3,
            semantic_weight: 0.7,
            mode: SearchMode::Hybrid,
            sub_query_index: 0,
            document_filter: Some(filter.as_slice()),
        };

        let candidates = retriever.retrieve(&query).await.unwrap();
        assert!(!candidates.is_empty());
        assert!(candidates.iter().all(|c| c.chunk.document_id == "brochure"));
    }

    #[tokio::test]
    async fn unavailable_index_is_an_error() {
        let corpus = corpus().await;
        corpus.set_available(false);
        let retriever = retriever(corpus);
        let terms = terms(&["battery"]);
        let query = RetrievalQuery {
            embedding: &[1.0, 0.0, 0.0],
            terms: &terms,
            k: 3,
            semantic_weight: 0.7,
            mode: SearchMode::Hybrid,
            sub_query_index: 0,
            document_filter: None,
        };

        let err = retriever.retrieve(&query).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }
}
