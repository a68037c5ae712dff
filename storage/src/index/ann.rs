use pagecite_core::embedding::cosine_similarity;
use pagecite_core::model::ChunkId;
use std::cmp::Ordering;
use std::collections::HashMap;

/// Exact cosine search over every stored chunk vector.
#[derive(Debug, Clone, Default)]
pub struct LinearAnnIndex {
    vectors: HashMap<ChunkId, Vec<f32>>,
}

fn by_score_then_id(a: &(ChunkId, f32), b: &(ChunkId, f32)) -> Ordering {
    b.1.partial_cmp(&a.1)
        .unwrap_or(Ordering::Equal)
        .then(a.0.cmp(&b.0))
}

impl LinearAnnIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ChunkId, vector: Vec<f32>) {
        self.vectors.insert(id, vector);
    }

    pub fn delete(&mut self, id: ChunkId) -> bool {
        self.vectors.remove(&id).is_some()
    }

    /// Top-k chunk ids by cosine similarity, best first, ties by ascending id.
    /// Vectors whose dimension differs from the query never match.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(ChunkId, f32)> {
        self.search_where(query, k, |_| true)
    }

    /// Like `search`, restricted to ids accepted by `admit`.
    pub fn search_where(
        &self,
        query: &[f32],
        k: usize,
        admit: impl Fn(ChunkId) -> bool,
    ) -> Vec<(ChunkId, f32)> {
        if k == 0 {
            return Vec::new();
        }
        let mut hits: Vec<(ChunkId, f32)> = self
            .vectors
            .iter()
            .filter(|(id, _)| admit(**id))
            .filter_map(|(id, vector)| {
                cosine_similarity(query, vector)
                    .filter(|score| score.is_finite())
                    .map(|score| (*id, score))
            })
            .collect();

        if hits.len() > k {
            hits.select_nth_unstable_by(k - 1, by_score_then_id);
            hits.truncate(k);
        }
        hits.sort_by(by_score_then_id);
        hits
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}
