use crate::index::{KeywordIndex, LinearAnnIndex};
use crate::store::{document_allowed, ChunkStore, Index, PageBlockStore, StoreError};
use async_trait::async_trait;
use pagecite_core::model::{Chunk, ChunkId, DocumentInfo, PageBlock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// One immutable view of the corpus. Writers publish a fresh copy, so a
/// snapshot held by a reader never changes underneath it.
#[derive(Debug, Clone, Default)]
pub struct CorpusSnapshot {
    chunks: HashMap<ChunkId, Arc<Chunk>>,
    blocks: HashMap<String, Vec<PageBlock>>,
    documents: HashMap<String, DocumentInfo>,
    vectors: LinearAnnIndex,
    keywords: KeywordIndex,
}

impl CorpusSnapshot {
    pub fn chunk(&self, id: ChunkId) -> Option<Arc<Chunk>> {
        self.chunks.get(&id).cloned()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn document(&self, id: &str) -> Option<&DocumentInfo> {
        self.documents.get(id)
    }

    pub fn documents(&self) -> impl Iterator<Item = &DocumentInfo> {
        self.documents.values()
    }

    fn admits(&self, id: ChunkId, documents: Option<&[String]>) -> bool {
        documents.is_none()
            || self
                .chunks
                .get(&id)
                .map_or(false, |chunk| document_allowed(documents, &chunk.document_id))
    }
}

/// In-memory reference implementation of the index, chunk store and page-block store.
pub struct MemoryCorpus {
    state: RwLock<Arc<CorpusSnapshot>>,
    available: AtomicBool,
}

impl MemoryCorpus {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(Arc::new(CorpusSnapshot::default())),
            available: AtomicBool::new(true),
        }
    }

    pub async fn snapshot(&self) -> Arc<CorpusSnapshot> {
        self.state.read().await.clone()
    }

    pub async fn put_document(&self, info: DocumentInfo, mut blocks: Vec<PageBlock>) {
        blocks.sort_by_key(|block| (block.char_start, block.page_number));
        let mut guard = self.state.write().await;
        let state = Arc::make_mut(&mut *guard);
        debug!(document_id = %info.id, blocks = blocks.len(), "publishing document layout");
        state.blocks.insert(info.id.clone(), blocks);
        state.documents.insert(info.id.clone(), info);
    }

    pub async fn put_chunk(&self, chunk: Chunk) {
        self.put_chunks(vec![chunk]).await;
    }

    pub async fn put_chunks(&self, chunks: Vec<Chunk>) {
        let mut guard = self.state.write().await;
        let state = Arc::make_mut(&mut *guard);
        for chunk in chunks {
            state.vectors.insert(chunk.id, chunk.embedding.clone());
            state.keywords.insert(chunk.id, &chunk.text);
            state.chunks.insert(chunk.id, Arc::new(chunk));
        }
    }

    pub async fn remove_document(&self, document_id: &str) -> usize {
        let mut guard = self.state.write().await;
        let state = Arc::make_mut(&mut *guard);
        let doomed: Vec<ChunkId> = state
            .chunks
            .values()
            .filter(|chunk| chunk.document_id == document_id)
            .map(|chunk| chunk.id)
            .collect();
        for id in &doomed {
            state.chunks.remove(id);
            state.vectors.delete(*id);
            state.keywords.delete(*id);
        }
        state.blocks.remove(document_id);
        state.documents.remove(document_id);
        doomed.len()
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory corpus is offline".to_string()))
        }
    }
}

impl Default for MemoryCorpus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Index for MemoryCorpus {
    async fn semantic_search(
        &self,
        embedding: &[f32],
        k: usize,
        documents: Option<&[String]>,
    ) -> Result<Vec<(ChunkId, f32)>, StoreError> {
        self.ensure_available()?;
        let snapshot = self.snapshot().await;
        Ok(snapshot
            .vectors
            .search_where(embedding, k, |id| snapshot.admits(id, documents)))
    }

    async fn keyword_search(
        &self,
        terms: &[String],
        k: usize,
        documents: Option<&[String]>,
    ) -> Result<Vec<(ChunkId, f32)>, StoreError> {
        self.ensure_available()?;
        let snapshot = self.snapshot().await;
        Ok(snapshot
            .keywords
            .search_where(terms, k, |id| snapshot.admits(id, documents)))
    }
}

#[async_trait]
impl ChunkStore for MemoryCorpus {
    async fn get(&self, chunk_id: ChunkId) -> Result<Arc<Chunk>, StoreError> {
        self.ensure_available()?;
        self.snapshot()
            .await
            .chunk(chunk_id)
            .ok_or(StoreError::ChunkNotFound(chunk_id))
    }
}

#[async_trait]
impl PageBlockStore for MemoryCorpus {
    async fn get(&self, document_id: &str) -> Result<Vec<PageBlock>, StoreError> {
        self.ensure_available()?;
        Ok(self
            .snapshot()
            .await
            .blocks
            .get(document_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn document(&self, document_id: &str) -> Result<Option<DocumentInfo>, StoreError> {
        self.ensure_available()?;
        Ok(self.snapshot().await.document(document_id).cloned())
    }
}
