use async_trait::async_trait;
use pagecite_core::config::EngineConfig;
use pagecite_core::embedding::{BoxFuture, Embedder};
use pagecite_core::model::{Chunk, DocumentInfo, PageBlock};
use pagecite_core::text::terms;
use query::{QueryEngine, QueryRequest, QueryState, RelevanceScorer, SearchMode};
use std::sync::Arc;
use storage::{DocumentMap, DocumentMapHandle, MemoryCorpus};

const DIMS: usize = 256;

/// Bag-of-words embedder so that shared vocabulary means shared direction.
struct BagOfWords;

fn bag(text: &str) -> Vec<f32> {
    let mut vector = vec![0.0; DIMS];
    for term in terms(text) {
        let hash = term
            .bytes()
            .fold(0xcbf2_9ce4_8422_2325u64, |h, b| (h ^ u64::from(b)).wrapping_mul(0x100_0000_01b3));
        vector[(hash % DIMS as u64) as usize] += 1.0;
    }
    vector
}

impl Embedder for BagOfWords {
    fn embed<'a>(&'a self, text: &'a str) -> BoxFuture<'a, Vec<f32>> {
        Box::pin(async move { bag(text) })
    }
}

struct ConstantScorer(f32);

#[async_trait]
impl RelevanceScorer for ConstantScorer {
    async fn score(&self, _query: &str, _passage: &str) -> anyhow::Result<f32> {
        Ok(self.0)
    }
}

/// Scores the full question differently from any of its sub-queries.
struct QuestionAwareScorer(&'static str);

#[async_trait]
impl RelevanceScorer for QuestionAwareScorer {
    async fn score(&self, query: &str, passage: &str) -> anyhow::Result<f32> {
        if query != self.0 {
            return Ok(1.0);
        }
        let mentions_port = terms(passage).iter().any(|term| term == "port");
        Ok(if mentions_port { 0.9 } else { 0.6 })
    }
}

fn chunk(id: u64, doc: &str, text: &str, start: u64, end: u64) -> Chunk {
    Chunk::new(id, doc, text, bag(text), start, end)
}

async fn manual_corpus() -> Arc<MemoryCorpus> {
    let corpus = Arc::new(MemoryCorpus::new());
    corpus
        .put_document(
            DocumentInfo::new("manual", "ev-manual.pdf", 3).with_chunk_count(4),
            vec![
                PageBlock::text(1, 0, 200),
                PageBlock::text(2, 200, 400),
                PageBlock::text(3, 400, 600),
            ],
        )
        .await;
    corpus
        .put_document(
            DocumentInfo::new("brochure", "brochure.pdf", 2),
            vec![
                PageBlock::image(1, 0, 0, 0),
                PageBlock::text(1, 0, 100),
                PageBlock::text(2, 100, 200),
            ],
        )
        .await;

    corpus
        .put_chunks(vec![
            chunk(1, "manual", "The battery warranty covers eight years or 160000 km.", 10, 60),
            chunk(2, "manual", "The charging port is located behind the left rear flap.", 210, 266),
            chunk(3, "manual", "Contact support@example.com for warranty claims.", 420, 468),
            chunk(4, "manual", "Regenerative braking recovers energy when slowing down.", 300, 355),
            chunk(5, "brochure", "Battery range reaches 500 km on a full charge.", 120, 166),
            Chunk::new(
                6,
                "brochure",
                "Figure 1: battery pack layout under the cabin floor",
                bag("Figure 1: battery pack layout under the cabin floor"),
                0,
                0,
            )
            .image_derived(Some(0)),
        ])
        .await;
    corpus
}

#[tokio::test]
async fn test_top_citation_carries_source_and_page() {
    let corpus = manual_corpus().await;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default());

    let response = engine
        .execute(QueryRequest::new("battery warranty").with_k(3))
        .await
        .unwrap();

    assert!(!response.citations.is_empty());
    assert!(response.citations.len() <= 3);
    let top = &response.citations[0];
    assert_eq!(top.chunk_id, 1);
    assert_eq!(top.source, "ev-manual.pdf");
    assert_eq!(top.page, 1);
    assert!((top.page_confidence - 1.0).abs() < 1e-6);
    assert!(top.snippet.contains("warranty"));
    if response.citations.len() > 1 {
        assert_eq!(top.similarity_percentage, Some(100.0));
    }
    assert_eq!(response.sub_queries_used, vec!["battery warranty".to_string()]);

    for pair in response.citations.windows(2) {
        assert!(pair[0].similarity_score >= pair[1].similarity_score);
    }
}

#[tokio::test]
async fn test_image_chunk_is_cited_on_its_image_page() {
    let corpus = manual_corpus().await;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default());

    let response = engine
        .execute(
            QueryRequest::new("battery pack layout")
                .with_search_mode(SearchMode::Keyword)
                .with_document_filter(["brochure"]),
        )
        .await
        .unwrap();

    let figure = response
        .citations
        .iter()
        .find(|citation| citation.chunk_id == 6)
        .expect("figure chunk cited");
    assert_eq!(figure.source, "brochure.pdf");
    assert_eq!(figure.page, 1);
    assert!(response
        .citations
        .iter()
        .all(|citation| citation.document_id == "brochure"));
}

#[tokio::test]
async fn test_pages_stay_within_document_bounds() {
    let corpus = Arc::new(MemoryCorpus::new());
    corpus
        .put_document(DocumentInfo::new("scan", "scan.pdf", 2), Vec::new())
        .await;
    corpus
        .put_chunks(vec![
            chunk(10, "scan", "torque settings for the wheel nuts", 0, 40).with_declared_page(9),
            chunk(11, "scan", "see page 40 for torque tables", 40, 80),
            chunk(12, "scan", "[Page 0] torque wrench calibration", 80, 120).with_declared_page(0),
            chunk(13, "scan", "torque limits for the motor mounts", 120, 160).with_ordinal(30),
        ])
        .await;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default());

    let response = engine
        .execute(
            QueryRequest::new("torque")
                .with_k(10)
                .with_search_mode(SearchMode::Keyword),
        )
        .await
        .unwrap();

    assert_eq!(response.citations.len(), 4);
    for citation in &response.citations {
        assert!((1..=2).contains(&citation.page), "page {} out of bounds", citation.page);
        assert!(citation.page_confidence > 0.0 && citation.page_confidence <= 1.0);
    }
    assert!(engine.metrics().page_clamps > 0);
}

#[tokio::test]
async fn test_near_duplicates_collapse_within_a_document_only() {
    let corpus = Arc::new(MemoryCorpus::new());
    corpus
        .put_document(DocumentInfo::new("service", "service-guide.pdf", 1), vec![PageBlock::text(1, 0, 500)])
        .await;
    corpus
        .put_document(DocumentInfo::new("bulletin", "bulletin.pdf", 1), vec![PageBlock::text(1, 0, 500)])
        .await;
    let text = "Replace the coolant every four years; the flush interval is fixed.";
    corpus
        .put_chunks(vec![
            chunk(20, "service", text, 0, 66),
            chunk(21, "service", text, 100, 166),
            chunk(22, "bulletin", text, 0, 66),
        ])
        .await;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default());

    let response = engine
        .execute(QueryRequest::new("coolant flush interval").with_k(5))
        .await
        .unwrap();

    let from = |doc: &str| {
        response
            .citations
            .iter()
            .filter(|citation| citation.document_id == doc)
            .count()
    };
    assert_eq!(from("service"), 1);
    assert_eq!(from("bulletin"), 1);
    assert!(response
        .citations
        .iter()
        .any(|citation| citation.chunk_id == 20));
}

#[tokio::test]
async fn test_no_match_is_an_empty_success() {
    let corpus = manual_corpus().await;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default());

    let (result, lifecycle) = engine
        .execute_traced(
            QueryRequest::new("zeppelin").with_search_mode(SearchMode::Keyword),
            Default::default(),
        )
        .await;

    let response = result.unwrap();
    assert!(response.citations.is_empty());
    assert_eq!(lifecycle.state(), &QueryState::Delivered);
    assert_eq!(lifecycle.history().len(), 8);

    let metrics = engine.metrics();
    assert_eq!(metrics.total_queries, 1);
    assert_eq!(metrics.failed_queries, 0);
    assert_eq!(metrics.empty_results, 1);
}

#[tokio::test]
async fn test_equal_relevance_omits_percentages() {
    let corpus = manual_corpus().await;
    let mut config = EngineConfig::default();
    config.rerank.retrieval_blend = 0.0;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), config)
        .with_relevance_scorer(Arc::new(ConstantScorer(0.5)));

    let response = engine
        .execute(
            QueryRequest::new("battery")
                .with_k(5)
                .with_search_mode(SearchMode::Keyword),
        )
        .await
        .unwrap();

    assert!(response.citations.len() >= 2);
    assert!(response
        .citations
        .iter()
        .all(|citation| citation.similarity_percentage.is_none()));
    assert!(response
        .citations
        .iter()
        .all(|citation| (citation.similarity_score - 0.5).abs() < 1e-6));

    let json = serde_json::to_value(&response).unwrap();
    assert!(json["citations"][0].get("similarity_percentage").is_none());
    assert!(json["citations"][0].get("source").is_some());
}

#[tokio::test]
async fn test_document_map_overrides_store_metadata() {
    let corpus = manual_corpus().await;
    let handle = Arc::new(DocumentMapHandle::new(DocumentMap::new(
        3,
        [DocumentInfo::new("manual", "Owner Manual (2nd edition).pdf", 3)],
    )));
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default())
        .with_document_map(handle);

    let response = engine
        .execute(QueryRequest::new("battery warranty").with_k(1))
        .await
        .unwrap();

    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].source, "Owner Manual (2nd edition).pdf");
}

#[tokio::test]
async fn test_compound_question_reports_sub_queries() {
    let corpus = manual_corpus().await;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default());

    let response = engine
        .execute(
            QueryRequest::new(
                "What does the battery warranty cover and where is the charging port located?",
            )
            .with_k(4),
        )
        .await
        .unwrap();

    assert_eq!(response.sub_queries_used.len(), 2);
    assert_eq!(response.sub_queries_used[0], "What does the battery warranty cover");
    let ids: Vec<u64> = response.citations.iter().map(|c| c.chunk_id).collect();
    assert!(ids.contains(&1));
    assert!(ids.contains(&2));
}

#[tokio::test]
async fn test_document_filter_reaches_matches_ranked_below_other_documents() {
    let corpus = Arc::new(MemoryCorpus::new());
    corpus
        .put_document(DocumentInfo::new("a", "a.pdf", 1), vec![PageBlock::text(1, 0, 3_000)])
        .await;
    corpus
        .put_document(DocumentInfo::new("b", "b.pdf", 1), vec![PageBlock::text(1, 0, 100)])
        .await;
    let mut chunks: Vec<Chunk> = (1..=30)
        .map(|id| chunk(id, "a", "battery battery", id * 20, id * 20 + 15))
        .collect();
    chunks.push(chunk(100, "b", "The battery is mentioned once among other notes.", 0, 48));
    corpus.put_chunks(chunks).await;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default());

    let response = engine
        .execute(
            QueryRequest::new("battery")
                .with_k(1)
                .with_search_mode(SearchMode::Keyword)
                .with_document_filter(["b"]),
        )
        .await
        .unwrap();

    assert_eq!(response.citations.len(), 1);
    assert_eq!(response.citations[0].chunk_id, 100);
    assert_eq!(response.citations[0].source, "b.pdf");
}

#[tokio::test]
async fn test_decomposed_query_scores_citations_against_the_question() {
    const QUESTION: &str = "What does the battery warranty cover and where is the charging port located?";
    let corpus = manual_corpus().await;
    let mut config = EngineConfig::default();
    config.rerank.retrieval_blend = 0.0;
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), config)
        .with_relevance_scorer(Arc::new(QuestionAwareScorer(QUESTION)));

    let response = engine
        .execute(QueryRequest::new(QUESTION).with_k(4))
        .await
        .unwrap();

    assert_eq!(response.sub_queries_used.len(), 2);
    let top = &response.citations[0];
    assert_eq!(top.chunk_id, 2);
    assert!((top.similarity_score - 0.9).abs() < 1e-6);
    assert_eq!(top.similarity_percentage, Some(100.0));
    for citation in &response.citations[1..] {
        assert!((citation.similarity_score - 0.6).abs() < 1e-6);
    }
}

#[tokio::test]
async fn test_offline_index_fails_the_query() {
    let corpus = manual_corpus().await;
    corpus.set_available(false);
    let engine = QueryEngine::from_corpus(corpus, Arc::new(BagOfWords), EngineConfig::default());

    let (result, lifecycle) = engine
        .execute_traced(QueryRequest::new("battery warranty"), Default::default())
        .await;

    match result {
        Err(query::QueryError::IndexUnavailable(reason)) => assert!(reason.contains("offline")),
        other => panic!("expected IndexUnavailable, got {:?}", other),
    }
    assert_eq!(
        lifecycle.state(),
        &QueryState::Failed("IndexUnavailable".to_string())
    );

    let metrics = engine.metrics();
    assert_eq!(metrics.total_queries, 1);
    assert_eq!(metrics.failed_queries, 1);
}
