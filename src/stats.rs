use std::collections::VecDeque;

use serde::Serialize;

use crate::RequestError;

/// Cumulative request counters exposed for polling.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub duplicate_requests: u64,
    pub retried_requests: u64,
    pub cache_hits: u64,
    pub network_errors: u64,
    /// Mean latency over the most recent settled requests.
    pub average_response_time_ms: f64,
}

impl NetworkStats {
    /// Percentage of requests that settled successfully.
    pub fn success_rate(&self) -> f64 {
        percentage(self.successful_requests, self.total_requests)
    }

    /// Percentage of requests coalesced onto an in-flight duplicate.
    pub fn deduplication_rate(&self) -> f64 {
        percentage(self.duplicate_requests, self.total_requests)
    }
}

fn percentage(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 / total as f64 * 100.0
    }
}

pub(crate) struct StatsCollector {
    stats: NetworkStats,
    latencies: VecDeque<u64>,
    window: usize,
}

impl StatsCollector {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            stats: NetworkStats::default(),
            latencies: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    pub(crate) fn record_request(&mut self) {
        self.stats.total_requests += 1;
    }

    pub(crate) fn record_cache_hit(&mut self) {
        self.stats.cache_hits += 1;
    }

    pub(crate) fn record_duplicate(&mut self) {
        self.stats.duplicate_requests += 1;
    }

    pub(crate) fn record_retry(&mut self) {
        self.stats.retried_requests += 1;
    }

    pub(crate) fn record_success(&mut self, latency_ms: u64) {
        self.stats.successful_requests += 1;
        if self.latencies.len() == self.window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency_ms);
        let sum: u64 = self.latencies.iter().sum();
        self.stats.average_response_time_ms = sum as f64 / self.latencies.len() as f64;
    }

    pub(crate) fn record_failure(&mut self, error: &RequestError) {
        self.stats.failed_requests += 1;
        if error.is_transport() {
            self.stats.network_errors += 1;
        }
    }

    pub(crate) fn reset_cache_hits(&mut self) {
        self.stats.cache_hits = 0;
    }

    pub(crate) fn reset(&mut self) {
        self.stats = NetworkStats::default();
        self.latencies.clear();
    }

    pub(crate) fn snapshot(&self) -> NetworkStats {
        self.stats.clone()
    }
}
