//! Reporting facade
//!
//! Aggregates point-in-time statistics from the pool, the queues and the
//! cache into one typed JSON document, plus a lightweight health signal for
//! cheap polling. Recommendations are operator guidance only; nothing in
//! here takes automated action.

pub mod handlers;
pub mod metrics;

use serde::Serialize;

use crate::cache::{CacheDetailedStats, ResponseCache};
use crate::pool::{ConnectionPool, PoolStats};
use crate::queue::{QueueDetailedStats, RequestQueueManager};

#[derive(Debug, Clone, Serialize)]
pub struct PerfReport {
    pub timestamp: String,
    /// False exactly while the queue manager reports high load
    pub healthy: bool,
    pub pool: PoolStats,
    pub queues: QueueDetailedStats,
    pub cache: CacheDetailedStats,
    pub recommendations: Vec<String>,
}

/// Lightweight companion to the full report; body stays a couple of fields
/// and the interesting numbers travel as headers.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSignal {
    pub healthy: bool,
    pub high_load: bool,
    pub cache_hit_rate_pct: f64,
    pub active_requests: usize,
}

/// Build the aggregated operational report. Explicit named fields, one
/// snapshot per component; no dynamic merging.
pub fn build_report(
    pool: &ConnectionPool,
    queues: &RequestQueueManager,
    cache: &ResponseCache,
) -> PerfReport {
    let pool_stats = pool.stats();
    let queue_stats = queues.detailed_stats();
    let cache_stats = cache.detailed_stats();
    let recommendations = recommendations(&pool_stats, &queue_stats, &cache_stats);
    PerfReport {
        timestamp: chrono::Utc::now().to_rfc3339(),
        healthy: !queue_stats.high_load,
        pool: pool_stats,
        queues: queue_stats,
        cache: cache_stats,
        recommendations,
    }
}

pub fn health_signal(
    pool: &ConnectionPool,
    queues: &RequestQueueManager,
    cache: &ResponseCache,
) -> HealthSignal {
    let high_load = queues.is_high_load();
    HealthSignal {
        healthy: !high_load,
        high_load,
        cache_hit_rate_pct: cache.stats().hit_rate_pct,
        active_requests: pool.stats().active_requests,
    }
}

/// Operator guidance rules. Thresholds are intentionally coarse; these feed
/// a dashboard, not an autoscaler.
pub fn recommendations(
    pool: &PoolStats,
    queues: &QueueDetailedStats,
    cache: &CacheDetailedStats,
) -> Vec<String> {
    let mut out = Vec::new();

    if pool.max_concurrent_requests > 0
        && pool.active_requests as f64 > 0.8 * pool.max_concurrent_requests as f64
    {
        out.push(
            "Pool utilization above 80% of max concurrent requests; consider raising POOL_MAX_CONCURRENT"
                .to_string(),
        );
    }

    if queues.total_pending > 50 {
        out.push(format!(
            "{} items pending across queues; consider scaling upstream backends",
            queues.total_pending
        ));
    }

    if cache.hits + cache.misses > 0 && cache.hit_rate_pct < 50.0 {
        out.push(
            "Cache hit rate below 50%; review request normalization feeding the cache keys"
                .to_string(),
        );
    }

    if cache.max_memory_mb > 0.0 && cache.estimated_memory_mb > 0.9 * cache.max_memory_mb {
        out.push(
            "Cache memory above 90% of budget; lower TTLs or raise the memory budget".to_string(),
        );
    }

    for (name, queue) in &queues.queues {
        if queue.avg_wait_ms > 5000.0 {
            out.push(format!(
                "Average wait in the {name} queue exceeds 5000ms; add upstream capacity"
            ));
        }
    }

    if queues.high_load {
        out.push(
            "High load: shed new sessions or enable circuit breaking until backlog drains"
                .to_string(),
        );
    }

    out
}
