use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use pagecite_core::config::EngineConfig;
use pagecite_core::embedding::{deterministic_embedding, DeterministicEmbedder};
use pagecite_core::model::{Chunk, DocumentInfo, DocumentLayout, PageBlock};
use query::{
    AttributedCandidate, Candidate, CitationRanker, PageResolver, QueryEngine, QueryRequest, ScoreChannel,
};
use std::sync::Arc;
use storage::MemoryCorpus;

const DIMS: usize = 32;
const MODEL_ID: &str = "embedding-default-v1";
const PAGES: u32 = 400;
const CHARS_PER_PAGE: u64 = 1_800;

fn layout() -> DocumentLayout {
    let blocks = (1..=PAGES)
        .map(|page| {
            let start = u64::from(page - 1) * CHARS_PER_PAGE;
            PageBlock::text(page, start, start + CHARS_PER_PAGE)
        })
        .collect();
    DocumentLayout::new(
        Some(DocumentInfo::new("report", "annual-report.pdf", PAGES).with_chunk_count(PAGES * 3)),
        blocks,
    )
}

fn chunk(id: u64) -> Chunk {
    let text = format!("Page {} section {id}: battery supply and cell chemistry outlook", id / 3 + 1);
    let start = id * 600 + 250;
    Chunk::new(id, "report", text.clone(), deterministic_embedding(&text, MODEL_ID, DIMS), start, start + 700)
        .with_declared_page((id / 3 + 1) as u32)
        .with_ordinal(id as u32)
}

fn bench_page_resolution(c: &mut Criterion) {
    let layout = layout();
    let chunks: Vec<Chunk> = (0..200).map(chunk).collect();
    let unblocked = DocumentLayout::new(layout.info.clone(), Vec::new());

    c.bench_function("page_resolution/char_overlap_400_pages", |b| {
        b.iter(|| {
            for chunk in &chunks {
                black_box(PageResolver::resolve(chunk, &layout));
            }
        })
    });
    c.bench_function("page_resolution/markers_without_blocks", |b| {
        b.iter(|| {
            for chunk in &chunks {
                black_box(PageResolver::resolve(chunk, &unblocked));
            }
        })
    });
}

fn bench_citation_ranking(c: &mut Criterion) {
    let layout = layout();
    let items: Vec<AttributedCandidate> = (0..50u64)
        .map(|id| {
            let chunk = Arc::new(chunk(id));
            let resolution = PageResolver::resolve(&chunk, &layout);
            AttributedCandidate {
                candidate: Candidate {
                    chunk,
                    raw_score: 1.0 - (id % 7) as f32 * 0.1,
                    channel: ScoreChannel::Hybrid,
                    sub_query_index: (id % 3) as usize,
                    retrieval_rank: id as usize,
                    semantic_score: None,
                    keyword_score: None,
                    rerank_score: None,
                },
                resolution,
                source: "annual-report.pdf".to_string(),
            }
        })
        .collect();
    let terms = vec!["battery".to_string(), "chemistry".to_string()];
    let ranker = CitationRanker::new(240);

    c.bench_function("citation_ranking/50_candidates", |b| {
        b.iter_batched(
            || items.clone(),
            |items| black_box(ranker.rank(items, &terms)),
            BatchSize::SmallInput,
        )
    });
}

fn bench_end_to_end(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let engine = runtime.block_on(async {
        let corpus = Arc::new(MemoryCorpus::new());
        let layout = layout();
        corpus
            .put_document(layout.info.clone().unwrap(), layout.blocks.clone())
            .await;
        corpus.put_chunks((0..1_000).map(chunk).collect()).await;
        QueryEngine::from_corpus(
            corpus,
            Arc::new(DeterministicEmbedder::new(MODEL_ID, DIMS)),
            EngineConfig::default(),
        )
    });

    c.bench_function("query/hybrid_1000_chunks", |b| {
        b.iter(|| {
            runtime
                .block_on(engine.execute(QueryRequest::new("battery cell chemistry outlook").with_k(5)))
                .unwrap()
        })
    });
}

criterion_group!(benches, bench_page_resolution, bench_citation_ranking, bench_end_to_end);
criterion_main!(benches);
