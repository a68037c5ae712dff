use sha2::{Digest, Sha256};
use std::future::Future;
use std::pin::Pin;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Produces query embeddings in the same space as the indexed chunks.
pub trait Embedder: Send + Sync {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Vec<f32>>;
}

/// Hash-derived embedder. Stable across runs, useful for fixtures and offline setups.
pub struct DeterministicEmbedder {
    model_id: String,
    dims: usize,
}

impl DeterministicEmbedder {
    pub fn new(model_id: impl Into<String>, dims: usize) -> Self {
        Self {
            model_id: model_id.into(),
            dims: dims.max(1),
        }
    }

    pub fn dims(&self) -> usize {
        self.dims
    }
}

impl Default for DeterministicEmbedder {
    fn default() -> Self {
        Self::new("embedding-default-v1", 64)
    }
}

impl Embedder for DeterministicEmbedder {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Vec<f32>> {
        Box::pin(async move { deterministic_embedding(text, &self.model_id, self.dims) })
    }
}

pub fn deterministic_embedding(text: &str, model_id: &str, dims: usize) -> Vec<f32> {
    let dims = dims.max(1);

    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();

    (0..dims)
        .map(|i| (digest[i % digest.len()] as f32 / 127.5) - 1.0)
        .collect()
}

/// Cosine similarity, or `None` when the vectors cannot be compared.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return Some(0.0);
    }

    Some(dot / (norm_a * norm_b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_embedding_is_reproducible_for_same_inputs() {
        let a = deterministic_embedding("hello", "embedding-default-v1", 8);
        let b = deterministic_embedding("hello", "embedding-default-v1", 8);
        assert_eq!(a, b);
        assert_ne!(a, deterministic_embedding("hello", "embedding-alt-v1", 8));
    }

    #[test]
    fn cosine_similarity_handles_mismatch_and_zero_vectors() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0]), None);
        assert_eq!(cosine_similarity(&[], &[]), None);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), Some(0.0));
        let same = cosine_similarity(&[0.3, 0.4], &[0.6, 0.8]).unwrap();
        assert!((same - 1.0).abs() < 1e-6);
    }

    #[test]
    fn deterministic_embedder_clamps_dimension() {
        assert_eq!(DeterministicEmbedder::new("m", 0).dims(), 1);
        assert_eq!(DeterministicEmbedder::default().dims(), 64);
    }
}
