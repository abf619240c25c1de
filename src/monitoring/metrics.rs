use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

// Global Prometheus registry
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// Cache metrics
pub static CACHE_HITS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("cache_hits_total", "Total cache hits").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static CACHE_MISSES_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("cache_misses_total", "Total cache misses").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

// Queue metrics
pub static QUEUE_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "queue_rejections_total",
            "Submissions rejected at the pending limit",
        ),
        &["queue"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static QUEUE_TIMEOUTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "queue_timeouts_total",
            "Items resolved with Timeout before completion",
        ),
        &["queue"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

pub static UPSTREAM_CALLS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(
        Opts::new(
            "upstream_calls_total",
            "Dispatched upstream calls by queue and outcome",
        ),
        &["queue", "outcome"],
    )
    .unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// Export all registered metrics in Prometheus text format
pub fn export_prometheus() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode Prometheus metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_contains_registered_counters() {
        CACHE_HITS_TOTAL.inc();
        QUEUE_REJECTIONS_TOTAL.with_label_values(&["stt"]).inc();
        let text = export_prometheus();
        assert!(text.contains("cache_hits_total"));
        assert!(text.contains("queue_rejections_total"));
    }
}
