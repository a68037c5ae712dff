//! Interfaces of the ingestion/storage collaborators the query engine reads from.

use async_trait::async_trait;
use pagecite_core::error::{ErrorCode, PageciteError};
use pagecite_core::model::{Chunk, ChunkId, DocumentInfo, PageBlock};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("chunk not found: {0}")]
    ChunkNotFound(ChunkId),
    #[error("snapshot error: {0}")]
    Snapshot(String),
}

impl PageciteError for StoreError {
    fn error_code(&self) -> ErrorCode {
        match self {
            StoreError::Unavailable(_) => ErrorCode::Unavailable,
            StoreError::ChunkNotFound(_) => ErrorCode::NotFound,
            StoreError::Snapshot(_) => ErrorCode::Internal,
        }
    }
}

/// True when `document_id` passes an optional document allow-list.
pub fn document_allowed(filter: Option<&[String]>, document_id: &str) -> bool {
    filter.map_or(true, |ids| ids.iter().any(|id| id == document_id))
}

/// Both searches return at most `k` hits, all from documents that pass `documents`.
/// The filter applies before the top-k cut.
#[async_trait]
pub trait Index: Send + Sync {
    async fn semantic_search(
        &self,
        embedding: &[f32],
        k: usize,
        documents: Option<&[String]>,
    ) -> Result<Vec<(ChunkId, f32)>, StoreError>;

    async fn keyword_search(
        &self,
        terms: &[String],
        k: usize,
        documents: Option<&[String]>,
    ) -> Result<Vec<(ChunkId, f32)>, StoreError>;
}

#[async_trait]
pub trait ChunkStore: Send + Sync {
    async fn get(&self, chunk_id: ChunkId) -> Result<Arc<Chunk>, StoreError>;
}

#[async_trait]
pub trait PageBlockStore: Send + Sync {
    /// Page blocks of a document ordered by `char_start`. Unknown documents yield none.
    async fn get(&self, document_id: &str) -> Result<Vec<PageBlock>, StoreError>;

    async fn document(&self, document_id: &str) -> Result<Option<DocumentInfo>, StoreError>;
}
