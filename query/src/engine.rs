use crate::cancel::CancelToken;
use crate::citation::{AttributedCandidate, Citation, CitationRanker};
use crate::dsl::{QueryRequest, SearchMode};
use crate::error::QueryError;
use crate::lifecycle::{QueryLifecycle, QueryState};
use crate::page::PageResolver;
use crate::planner::{Decomposition, QueryDecomposer, QueryPlan, QueryPlanner};
use crate::rerank::{limit_per_key, RelevanceScorer, Reranker};
use crate::retriever::{Candidate, HybridRetriever, RetrievalQuery};
use pagecite_core::config::EngineConfig;
use pagecite_core::embedding::Embedder;
use pagecite_core::metrics::{MetricsCollector, MetricsSnapshot};
use pagecite_core::model::{Chunk, DocumentInfo, DocumentLayout};
use pagecite_core::text::query_terms;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use storage::{ChunkStore, DocumentMapHandle, Index, MemoryCorpus, PageBlockStore, StoreError};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResponse {
    pub citations: Vec<Citation>,
    /// Sub-queries whose retrieval completed, in plan order.
    pub sub_queries_used: Vec<String>,
    pub latency_ms: u64,
}

pub struct QueryEngine {
    retriever: Arc<HybridRetriever>,
    pages: Arc<dyn PageBlockStore>,
    embedder: Arc<dyn Embedder>,
    planner: QueryPlanner,
    reranker: Arc<Reranker>,
    config: EngineConfig,
    metrics: MetricsCollector,
    document_map: Option<Arc<DocumentMapHandle>>,
}

impl QueryEngine {
    pub fn new(
        index: Arc<dyn Index>,
        chunks: Arc<dyn ChunkStore>,
        pages: Arc<dyn PageBlockStore>,
        embedder: Arc<dyn Embedder>,
        config: EngineConfig,
    ) -> Self {
        Self {
            retriever: Arc::new(HybridRetriever::new(
                index,
                chunks,
                config.retrieval.overfetch_factor,
            )),
            pages,
            embedder,
            planner: QueryPlanner::heuristic(config.planner.clone(), config.retrieval.clone()),
            reranker: Arc::new(Reranker::lexical(config.rerank.clone())),
            config,
            metrics: MetricsCollector::default(),
            document_map: None,
        }
    }

    /// Engine over an in-memory corpus serving as index, chunk store and page-block store.
    pub fn from_corpus(corpus: Arc<MemoryCorpus>, embedder: Arc<dyn Embedder>, config: EngineConfig) -> Self {
        Self::new(corpus.clone(), corpus.clone(), corpus, embedder, config)
    }

    pub fn with_decomposer(mut self, decomposer: Arc<dyn QueryDecomposer>) -> Self {
        self.planner = QueryPlanner::new(
            decomposer,
            self.config.planner.clone(),
            self.config.retrieval.clone(),
        );
        self
    }

    pub fn with_relevance_scorer(mut self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        self.reranker = Arc::new(Reranker::new(scorer, self.config.rerank.clone()));
        self
    }

    /// Prefer document metadata from a hot-reloaded document map.
    pub fn with_document_map(mut self, handle: Arc<DocumentMapHandle>) -> Self {
        self.document_map = Some(handle);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCollector) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub async fn execute_json(&self, raw: &str) -> Result<QueryResponse, QueryError> {
        let request = match QueryRequest::parse_json(raw) {
            Ok(request) => request,
            Err(err) => {
                self.metrics.record_failure();
                debug!(error = %err, "malformed query request");
                return Err(QueryError::InvalidQuery(err.to_string()));
            }
        };
        self.execute(request).await
    }

    pub async fn execute(&self, request: QueryRequest) -> Result<QueryResponse, QueryError> {
        self.execute_with_cancel(request, CancelToken::new()).await
    }

    pub async fn execute_with_cancel(
        &self,
        request: QueryRequest,
        cancel: CancelToken,
    ) -> Result<QueryResponse, QueryError> {
        self.execute_traced(request, cancel).await.0
    }

    /// Run a query and return its lifecycle alongside the outcome.
    pub async fn execute_traced(
        &self,
        request: QueryRequest,
        cancel: CancelToken,
    ) -> (Result<QueryResponse, QueryError>, QueryLifecycle) {
        let start = Instant::now();
        let mut lifecycle = QueryLifecycle::new();
        let deadline_ms = self.config.concurrency.query_deadline_ms;

        let deadline = async {
            if deadline_ms == 0 {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(Duration::from_millis(deadline_ms)).await
            }
        };

        // Losing branches are dropped here, which aborts any in-flight sub-query tasks.
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            _ = deadline => Err(QueryError::DeadlineExceeded(deadline_ms)),
            result = self.run(&request, &mut lifecycle) => result,
        };

        let outcome = outcome.and_then(|citations_and_used| {
            lifecycle.advance(QueryState::Delivered)?;
            Ok(citations_and_used)
        });

        match outcome {
            Ok((citations, sub_queries_used)) => {
                let elapsed = start.elapsed();
                self.metrics
                    .record_query(elapsed.as_micros() as u64, citations.len());
                info!(
                    citations = citations.len(),
                    sub_queries = sub_queries_used.len(),
                    latency_ms = elapsed.as_millis() as u64,
                    "query delivered"
                );
                let response = QueryResponse {
                    citations,
                    sub_queries_used,
                    latency_ms: elapsed.as_millis() as u64,
                };
                (Ok(response), lifecycle)
            }
            Err(err) => {
                self.metrics.record_failure();
                if let Err(transition) = lifecycle.fail(err.reason()) {
                    debug!(error = %transition, "lifecycle already terminal");
                }
                match &err {
                    QueryError::IndexUnavailable(_) | QueryError::Internal(_) => {
                        error!(error = %err, "query failed")
                    }
                    QueryError::InvalidQuery(_) => debug!(error = %err, "query rejected"),
                    _ => warn!(error = %err, "query failed"),
                }
                (Err(err), lifecycle)
            }
        }
    }

    async fn run(
        &self,
        request: &QueryRequest,
        lifecycle: &mut QueryLifecycle,
    ) -> Result<(Vec<Citation>, Vec<String>), QueryError> {
        request.validate()?;

        let plan = self.planner.plan_request(request).await;
        if plan.decomposition == Decomposition::FellBack {
            self.metrics.record_decomposition_fallback();
        }
        lifecycle.advance(QueryState::Decomposed)?;

        lifecycle.advance(QueryState::Retrieving)?;
        let (pool, sub_queries_used) = self.fan_out(request, &plan).await?;

        lifecycle.advance(QueryState::Merged)?;
        let budget = plan.total_candidate_budget;
        let mut merged = self.reranker.deduplicate(pool);
        merged.truncate(budget);
        debug!(candidates = merged.len(), budget, "sub-query results merged");

        // Citations compare relevance to the full question, not to sub-queries.
        let reranked = self.reranker.rerank(merged, &request.question).await;
        lifecycle.advance(QueryState::Reranked)?;
        let diversified = self.reranker.diversify(reranked, budget);

        lifecycle.advance(QueryState::PagesResolved)?;
        let attributed = self.attribute_pages(diversified).await;
        let mut attributed = limit_per_key(
            attributed,
            self.config.rerank.max_chunks_per_page,
            |item: &AttributedCandidate| {
                (
                    item.candidate.chunk.document_id.clone(),
                    item.resolution.page,
                )
            },
        );
        attributed.truncate(request.k);

        lifecycle.advance(QueryState::Ranked)?;
        let ranker = CitationRanker::new(self.config.citation.snippet_chars);
        let citations = ranker.rank(attributed, &query_terms(&request.question));

        Ok((citations, sub_queries_used))
    }

    /// Retrieve and rerank every sub-query on a bounded pool of tasks and
    /// collect whatever completes within the per-sub-query timeout.
    async fn fan_out(
        &self,
        request: &QueryRequest,
        plan: &QueryPlan,
    ) -> Result<(Vec<Candidate>, Vec<String>), QueryError> {
        let total = plan.sub_queries.len();
        let workers = total.min(self.config.concurrency.worker_cap.max(1)).max(1);
        let semaphore = Arc::new(Semaphore::new(workers));
        let timeout = Duration::from_millis(self.config.concurrency.sub_query_timeout_ms.max(1));

        let mut tasks = JoinSet::new();
        for (index, text) in plan.sub_queries.iter().enumerate() {
            let job = SubQueryJob {
                index,
                text: text.clone(),
                k: plan.per_sub_query_k,
                semantic_weight: plan.semantic_weight,
                mode: request.search_mode,
                document_filter: request.document_filter.clone(),
                retriever: self.retriever.clone(),
                reranker: self.reranker.clone(),
                embedder: self.embedder.clone(),
            };
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let outcome = match semaphore.acquire_owned().await {
                    Ok(_permit) => match tokio::time::timeout(timeout, job.run()).await {
                        Ok(Ok(candidates)) => SubQueryOutcome::Completed(candidates),
                        Ok(Err(err)) => SubQueryOutcome::Failed(err),
                        Err(_) => SubQueryOutcome::TimedOut,
                    },
                    Err(_) => SubQueryOutcome::Failed(StoreError::Unavailable(
                        "sub-query worker pool closed".to_string(),
                    )),
                };
                (index, outcome)
            });
        }

        let mut completed = vec![false; total];
        let mut timed_out = 0usize;
        let mut pool = Vec::new();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, SubQueryOutcome::Completed(candidates))) => {
                    debug!(sub_query = index, candidates = candidates.len(), "sub-query completed");
                    completed[index] = true;
                    pool.extend(candidates);
                }
                Ok((index, SubQueryOutcome::TimedOut)) => {
                    timed_out += 1;
                    self.metrics.record_sub_query_timeout();
                    warn!(
                        sub_query = index,
                        timeout_ms = timeout.as_millis() as u64,
                        "sub-query timed out, dropping its candidates"
                    );
                }
                Ok((index, SubQueryOutcome::Failed(StoreError::Unavailable(reason)))) => {
                    tasks.abort_all();
                    error!(sub_query = index, %reason, "index unavailable");
                    return Err(QueryError::IndexUnavailable(reason));
                }
                Ok((index, SubQueryOutcome::Failed(err))) => {
                    warn!(sub_query = index, error = %err, "sub-query failed, dropping its candidates");
                }
                Err(join_err) => {
                    warn!(error = %join_err, "sub-query task did not finish");
                }
            }
        }

        if !completed.iter().any(|done| *done) {
            if timed_out == total {
                return Err(QueryError::AllRetrievalTimedOut(total));
            }
            return Err(QueryError::Internal(format!(
                "none of {total} sub-queries completed"
            )));
        }

        let used = plan
            .sub_queries
            .iter()
            .zip(&completed)
            .filter(|(_, done)| **done)
            .map(|(text, _)| text.clone())
            .collect();
        Ok((pool, used))
    }

    /// Resolve the page of every candidate. Layouts are read once per document.
    async fn attribute_pages(&self, candidates: Vec<Candidate>) -> Vec<AttributedCandidate> {
        let document_map = self.document_map.as_ref().map(|handle| handle.load());
        let mut layouts: HashMap<String, DocumentLayout> = HashMap::new();

        let mut attributed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let document_id = candidate.chunk.document_id.clone();
            if !layouts.contains_key(&document_id) {
                let known = document_map
                    .as_ref()
                    .and_then(|map| map.get(&document_id).cloned());
                let layout = self.load_layout(&candidate.chunk, known).await;
                layouts.insert(document_id.clone(), layout);
            }
            let Some(layout) = layouts.get(&document_id) else {
                continue;
            };

            let resolution = PageResolver::resolve(&candidate.chunk, layout);
            self.metrics
                .record_page_resolution(resolution.method.as_str(), resolution.clamped);
            let source = layout
                .source()
                .map(str::to_string)
                .unwrap_or_else(|| document_id.clone());
            attributed.push(AttributedCandidate {
                candidate,
                resolution,
                source,
            });
        }
        attributed
    }

    async fn load_layout(
        &self,
        chunk: &Chunk,
        known: Option<DocumentInfo>,
    ) -> DocumentLayout {
        let document_id = chunk.document_id.as_str();
        let blocks = match self.pages.get(document_id).await {
            Ok(blocks) => blocks,
            Err(err) => {
                warn!(document_id, error = %err, "page blocks unavailable, resolving without them");
                Vec::new()
            }
        };
        let info = match known {
            Some(info) => Some(info),
            None => match self.pages.document(document_id).await {
                Ok(info) => info,
                Err(err) => {
                    warn!(document_id, error = %err, "document info unavailable");
                    None
                }
            },
        };
        DocumentLayout::new(info, blocks)
    }
}

enum SubQueryOutcome {
    Completed(Vec<Candidate>),
    TimedOut,
    Failed(StoreError),
}

/// Everything one sub-query task owns.
struct SubQueryJob {
    index: usize,
    text: String,
    k: usize,
    semantic_weight: f32,
    mode: SearchMode,
    document_filter: Option<Vec<String>>,
    retriever: Arc<HybridRetriever>,
    reranker: Arc<Reranker>,
    embedder: Arc<dyn Embedder>,
}

impl SubQueryJob {
    async fn run(self) -> Result<Vec<Candidate>, StoreError> {
        let embedding = if self.mode == SearchMode::Keyword {
            Vec::new()
        } else {
            self.embedder.embed(&self.text).await
        };
        let terms = query_terms(&self.text);
        let query = RetrievalQuery {
            embedding: &embedding,
            terms: &terms,
            k: self.k,
            semantic_weight: self.semantic_weight,
            mode: self.mode,
            sub_query_index: self.index,
            document_filter: self.document_filter.as_deref(),
        };
        let candidates = self.retriever.retrieve(&query).await?;
        Ok(self.reranker.refine(candidates, &self.text, self.k).await)
    }
}
