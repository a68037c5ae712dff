pub mod cancel;
pub mod citation;
pub mod dsl;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod page;
pub mod planner;
pub mod rerank;
pub mod retriever;

pub use cancel::CancelToken;
pub use citation::{AttributedCandidate, Citation, CitationRanker};
pub use dsl::{QueryRequest, QueryValidationError, SearchMode};
pub use engine::{QueryEngine, QueryResponse};
pub use error::QueryError;
pub use lifecycle::{QueryLifecycle, QueryState};
pub use page::{PageResolution, PageResolver, ResolutionMethod};
pub use planner::{HeuristicDecomposer, QueryClass, QueryDecomposer, QueryPlan, QueryPlanner};
pub use rerank::{LexicalRelevanceScorer, RelevanceScorer, Reranker};
pub use retriever::{Candidate, HybridRetriever, RetrievalQuery, ScoreChannel};
