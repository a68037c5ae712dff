use pagecite_core::model::ChunkId;
use pagecite_core::text::terms;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

const BM25_K1: f32 = 1.2;
const BM25_B: f32 = 0.75;

/// Term-frequency inverted index scored with BM25.
#[derive(Debug, Clone, Default)]
pub struct KeywordIndex {
    postings: HashMap<String, HashMap<ChunkId, u32>>,
    doc_lengths: HashMap<ChunkId, u32>,
    total_length: u64,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: ChunkId, text: &str) {
        self.delete(id);

        let tokens = terms(text);
        let doc_len = tokens.len() as u32;
        self.doc_lengths.insert(id, doc_len);
        self.total_length += u64::from(doc_len);

        for token in tokens {
            *self
                .postings
                .entry(token)
                .or_default()
                .entry(id)
                .or_insert(0) += 1;
        }
    }

    pub fn delete(&mut self, id: ChunkId) -> bool {
        let Some(doc_len) = self.doc_lengths.remove(&id) else {
            return false;
        };
        self.total_length = self.total_length.saturating_sub(u64::from(doc_len));
        self.postings.retain(|_, docs| {
            docs.remove(&id);
            !docs.is_empty()
        });
        true
    }

    /// Top-k chunks by BM25 over the given query terms. Repeated terms count once.
    pub fn search(&self, query_terms: &[String], k: usize) -> Vec<(ChunkId, f32)> {
        self.search_where(query_terms, k, |_| true)
    }

    /// Like `search`, restricted to ids accepted by `admit`. Corpus statistics
    /// still cover every indexed chunk.
    pub fn search_where(
        &self,
        query_terms: &[String],
        k: usize,
        admit: impl Fn(ChunkId) -> bool,
    ) -> Vec<(ChunkId, f32)> {
        if self.doc_lengths.is_empty() || k == 0 {
            return Vec::new();
        }

        let n = self.doc_lengths.len() as f32;
        let avg_len = (self.total_length as f32 / n).max(1.0);
        let mut scores: HashMap<ChunkId, f32> = HashMap::new();

        let mut seen = HashSet::new();
        for term in query_terms {
            if !seen.insert(term.as_str()) {
                continue;
            }
            let Some(docs) = self.postings.get(term) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();

            for (id, tf) in docs.iter().filter(|(id, _)| admit(**id)) {
                let doc_len = self.doc_lengths.get(id).copied().unwrap_or(1) as f32;
                let tf = *tf as f32;
                let score = idf * (tf * (BM25_K1 + 1.0))
                    / (tf + BM25_K1 * (1.0 - BM25_B + BM25_B * doc_len / avg_len));
                *scores.entry(*id).or_insert(0.0) += score;
            }
        }

        let mut results: Vec<(ChunkId, f32)> = scores.into_iter().collect();
        results.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        results.truncate(k);
        results
    }

    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }
}
