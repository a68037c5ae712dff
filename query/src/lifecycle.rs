use pagecite_core::error::{ErrorCode, PageciteError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryState {
    Received,
    Decomposed,
    Retrieving,
    Merged,
    Reranked,
    PagesResolved,
    Ranked,
    Delivered,
    Failed(String),
}

impl QueryState {
    fn successor(&self) -> Option<QueryState> {
        match self {
            QueryState::Received => Some(QueryState::Decomposed),
            QueryState::Decomposed => Some(QueryState::Retrieving),
            QueryState::Retrieving => Some(QueryState::Merged),
            QueryState::Merged => Some(QueryState::Reranked),
            QueryState::Reranked => Some(QueryState::PagesResolved),
            QueryState::PagesResolved => Some(QueryState::Ranked),
            QueryState::Ranked => Some(QueryState::Delivered),
            QueryState::Delivered | QueryState::Failed(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Delivered | QueryState::Failed(_))
    }
}

impl fmt::Display for QueryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueryState::Failed(reason) => write!(f, "Failed({reason})"),
            other => write!(f, "{other:?}"),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("invalid query state transition {from} -> {to}")]
pub struct LifecycleError {
    pub from: QueryState,
    pub to: QueryState,
}

impl PageciteError for LifecycleError {
    fn error_code(&self) -> ErrorCode {
        ErrorCode::Internal
    }
}

/// Tracks the per-query state sequence and rejects out-of-order transitions.
#[derive(Debug, Clone)]
pub struct QueryLifecycle {
    history: Vec<QueryState>,
}

impl Default for QueryLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryLifecycle {
    pub fn new() -> Self {
        Self {
            history: vec![QueryState::Received],
        }
    }

    pub fn state(&self) -> &QueryState {
        // history always starts with Received
        &self.history[self.history.len() - 1]
    }

    pub fn history(&self) -> &[QueryState] {
        &self.history
    }

    pub fn advance(&mut self, next: QueryState) -> Result<(), LifecycleError> {
        let current = self.state();
        if current.successor().as_ref() != Some(&next) {
            return Err(LifecycleError {
                from: current.clone(),
                to: next,
            });
        }
        debug!(from = %current, to = %next, "query state");
        self.history.push(next);
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), LifecycleError> {
        let next = QueryState::Failed(reason.into());
        if self.state().is_terminal() {
            return Err(LifecycleError {
                from: self.state().clone(),
                to: next,
            });
        }
        debug!(from = %self.state(), to = %next, "query state");
        self.history.push(next);
        Ok(())
    }
}
