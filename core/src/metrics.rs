use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct QueryMetrics {
    pub total_queries: u64,
    pub failed_queries: u64,
    pub empty_results: u64,
    pub latencies: VecDeque<u64>, // microseconds
}

#[derive(Debug, Clone, Default)]
pub struct DegradationMetrics {
    pub sub_query_timeouts: u64,
    pub decomposition_fallbacks: u64,
    pub page_clamps: u64,
    pub resolution_methods: BTreeMap<String, u64>,
}

#[derive(Clone)]
pub struct MetricsCollector {
    state: Arc<Mutex<MetricsState>>,
}

struct MetricsState {
    query_metrics: QueryMetrics,
    degradation: DegradationMetrics,
    max_history: usize,
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MetricsState {
                query_metrics: QueryMetrics::default(),
                degradation: DegradationMetrics::default(),
                max_history: max_history.max(1),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        // Counters stay meaningful even if a recording thread panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_query(&self, latency_us: u64, citation_count: usize) {
        let mut state = self.lock();
        state.query_metrics.total_queries += 1;
        if citation_count == 0 {
            state.query_metrics.empty_results += 1;
        }
        state.query_metrics.latencies.push_back(latency_us);
        if state.query_metrics.latencies.len() > state.max_history {
            state.query_metrics.latencies.pop_front();
        }
    }

    pub fn record_failure(&self) {
        let mut state = self.lock();
        state.query_metrics.total_queries += 1;
        state.query_metrics.failed_queries += 1;
    }

    pub fn record_sub_query_timeout(&self) {
        self.lock().degradation.sub_query_timeouts += 1;
    }

    pub fn record_decomposition_fallback(&self) {
        self.lock().degradation.decomposition_fallbacks += 1;
    }

    pub fn record_page_resolution(&self, method: &str, clamped: bool) {
        let mut state = self.lock();
        *state
            .degradation
            .resolution_methods
            .entry(method.to_string())
            .or_insert(0) += 1;
        if clamped {
            state.degradation.page_clamps += 1;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let state = self.lock();
        let q = &state.query_metrics;
        let d = &state.degradation;

        let mut sorted_latencies: Vec<u64> = q.latencies.iter().copied().collect();
        sorted_latencies.sort_unstable();

        MetricsSnapshot {
            total_queries: q.total_queries,
            failed_queries: q.failed_queries,
            empty_results: q.empty_results,
            p50: percentile(&sorted_latencies, 50.0),
            p95: percentile(&sorted_latencies, 95.0),
            p99: percentile(&sorted_latencies, 99.0),
            history_count: q.latencies.len(),
            sub_query_timeouts: d.sub_query_timeouts,
            decomposition_fallbacks: d.decomposition_fallbacks,
            page_clamps: d.page_clamps,
            resolution_methods: d.resolution_methods.clone(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(1_024)
    }
}

fn percentile(sorted: &[u64], p: f32) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let idx = ((p / 100.0) * (sorted.len() as f32)).ceil() as usize;
    sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct MetricsSnapshot {
    pub total_queries: u64,
    pub failed_queries: u64,
    pub empty_results: u64,
    pub p50: u64,
    pub p95: u64,
    pub p99: u64,
    pub history_count: usize,
    pub sub_query_timeouts: u64,
    pub decomposition_fallbacks: u64,
    pub page_clamps: u64,
    pub resolution_methods: BTreeMap<String, u64>,
}
