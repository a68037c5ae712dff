use rkyv::Archive;
use serde::{Deserialize, Serialize};

pub type ChunkId = u64;

/// Immutable unit of indexed text with its character span in the source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub text: String,
    pub embedding: Vec<f32>,
    pub document_id: String,
    pub char_start: u64,
    pub char_end: u64,
    /// Page number recorded at ingestion. May be wrong.
    #[serde(default)]
    pub declared_page: Option<u32>,
    #[serde(default)]
    pub is_image_derived: bool,
    #[serde(default)]
    pub image_index: Option<u32>,
    /// Position of this chunk among all chunks of its document (0-based).
    #[serde(default)]
    pub ordinal: Option<u32>,
}

impl Chunk {
    pub fn new(
        id: ChunkId,
        document_id: impl Into<String>,
        text: impl Into<String>,
        embedding: Vec<f32>,
        char_start: u64,
        char_end: u64,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            embedding,
            document_id: document_id.into(),
            char_start,
            char_end,
            declared_page: None,
            is_image_derived: false,
            image_index: None,
            ordinal: None,
        }
    }

    pub fn with_declared_page(mut self, page: u32) -> Self {
        self.declared_page = Some(page);
        self
    }

    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = Some(ordinal);
        self
    }

    pub fn image_derived(mut self, image_index: Option<u32>) -> Self {
        self.is_image_derived = true;
        self.image_index = image_index;
        self
    }

    pub fn char_len(&self) -> u64 {
        self.char_end.saturating_sub(self.char_start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    #[default]
    Text,
    Image,
}

/// One contiguous, page-scoped span of a source document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageBlock {
    pub page_number: u32,
    pub char_start: u64,
    pub char_end: u64,
    #[serde(default, rename = "type")]
    pub kind: BlockKind,
    #[serde(default)]
    pub image_index: Option<u32>,
}

impl PageBlock {
    pub fn text(page_number: u32, char_start: u64, char_end: u64) -> Self {
        Self {
            page_number,
            char_start,
            char_end,
            kind: BlockKind::Text,
            image_index: None,
        }
    }

    pub fn image(page_number: u32, char_start: u64, char_end: u64, image_index: u32) -> Self {
        Self {
            page_number,
            char_start,
            char_end,
            kind: BlockKind::Image,
            image_index: Some(image_index),
        }
    }

    /// Number of characters shared with the half-open span `[start, end)`.
    pub fn overlap(&self, start: u64, end: u64) -> u64 {
        let lo = self.char_start.max(start);
        let hi = self.char_end.min(end);
        hi.saturating_sub(lo)
    }

    pub fn contains(&self, offset: u64) -> bool {
        self.char_start <= offset && offset < self.char_end
    }
}

#[derive(
    Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
    Serialize,
    Deserialize,
    Debug,
    Clone,
    PartialEq,
    Eq,
)]
#[archive(check_bytes)]
pub struct DocumentInfo {
    pub id: String,
    /// Display name rendered as the citation source.
    pub source: String,
    pub page_count: u32,
    #[serde(default)]
    pub chunk_count: u32,
}

impl DocumentInfo {
    pub fn new(id: impl Into<String>, source: impl Into<String>, page_count: u32) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            page_count: page_count.max(1),
            chunk_count: 0,
        }
    }

    pub fn with_chunk_count(mut self, chunk_count: u32) -> Self {
        self.chunk_count = chunk_count;
        self
    }
}

/// Page-block map of a single document as seen by one query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DocumentLayout {
    pub info: Option<DocumentInfo>,
    pub blocks: Vec<PageBlock>,
}

impl DocumentLayout {
    pub fn new(info: Option<DocumentInfo>, blocks: Vec<PageBlock>) -> Self {
        Self { info, blocks }
    }

    pub fn page_count(&self) -> u32 {
        if let Some(info) = &self.info {
            return info.page_count.max(1);
        }
        self.blocks
            .iter()
            .map(|block| block.page_number)
            .max()
            .unwrap_or(1)
            .max(1)
    }

    pub fn chunk_count(&self) -> Option<u32> {
        self.info
            .as_ref()
            .map(|info| info.chunk_count)
            .filter(|count| *count > 0)
    }

    pub fn source(&self) -> Option<&str> {
        self.info.as_ref().map(|info| info.source.as_str())
    }
}
