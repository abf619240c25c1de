//! Global Cache System
//!
//! Content-keyed cache of upstream responses, consulted before the request
//! queue so only misses pay for a slot. Two spaces with independent entry and
//! memory budgets: synthesized audio, and transcript/completion text. Budget
//! pressure evicts least-recently-used entries; it never rejects a store.
//! Caching is strictly an optimization: a failed lookup or store degrades to
//! a miss / no-store, never to a failed call.

pub mod keys;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::{CacheConfig, SpaceConfig};
use crate::monitoring::metrics;

/// Fixed per-entry overhead added to the value size estimate (key, stamps,
/// map slot).
const ENTRY_OVERHEAD_BYTES: usize = 64;

/// Logical cache namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSpace {
    TtsAudio,
    Text,
}

impl CacheSpace {
    pub const ALL: [CacheSpace; 2] = [CacheSpace::TtsAudio, CacheSpace::Text];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheSpace::TtsAudio => "tts_audio",
            CacheSpace::Text => "text",
        }
    }
}

impl std::fmt::Display for CacheSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct CacheEntry {
    value: Vec<u8>,
    stored_at: Instant,
    ttl: Duration,
    size_bytes: usize,
}

impl CacheEntry {
    fn expired_at(&self, now: Instant) -> bool {
        now.duration_since(self.stored_at) >= self.ttl
    }
}

struct SpaceState {
    // Unbounded here; budgets are enforced manually in `put` because the
    // memory budget needs byte accounting the cap-based constructor can't do.
    entries: LruCache<String, CacheEntry>,
    memory_bytes: usize,
    evictions: u64,
    expired_removed: u64,
}

struct Space {
    config: SpaceConfig,
    state: Mutex<SpaceState>,
}

impl Space {
    fn new(config: SpaceConfig) -> Self {
        Self {
            config,
            state: Mutex::new(SpaceState {
                entries: LruCache::unbounded(),
                memory_bytes: 0,
                evictions: 0,
                expired_removed: 0,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceStats {
    pub entries: usize,
    pub memory_bytes: usize,
    pub evictions: u64,
    pub expired_removed: u64,
    pub max_entries: usize,
    pub max_memory_mb: f64,
}

/// Lightweight subset for cheap polling
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hit_rate_pct: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheDetailedStats {
    pub hit_rate_pct: f64,
    pub hit_rate_grade: &'static str,
    pub hits: u64,
    pub misses: u64,
    pub total_entries: usize,
    pub estimated_memory_mb: f64,
    pub max_entries: usize,
    pub max_memory_mb: f64,
    pub spaces: HashMap<&'static str, SpaceStats>,
}

/// Operator-facing classification of a hit rate. Reporting only; eviction
/// never consults it.
pub fn hit_rate_grade(rate_pct: f64) -> &'static str {
    if rate_pct >= 80.0 {
        "excellent"
    } else if rate_pct >= 60.0 {
        "good"
    } else if rate_pct >= 40.0 {
        "fair"
    } else {
        "poor"
    }
}

pub struct ResponseCache {
    spaces: HashMap<CacheSpace, Space>,
    sweep_interval: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    shutdown: Notify,
    shutting_down: AtomicBool,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Arc<Self> {
        let mut spaces = HashMap::new();
        spaces.insert(CacheSpace::TtsAudio, Space::new(config.tts_audio));
        spaces.insert(CacheSpace::Text, Space::new(config.text));
        Arc::new(Self {
            spaces,
            sweep_interval: config.sweep_interval,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    fn space(&self, space: CacheSpace) -> &Space {
        // Both spaces are inserted in `new`
        &self.spaces[&space]
    }

    /// Look up `key`. A hit refreshes recency and access count; an entry past
    /// its TTL is removed inline and counted as a miss.
    pub fn get(&self, space: CacheSpace, key: &str) -> Option<Vec<u8>> {
        enum Lookup {
            Hit(Vec<u8>),
            Expired,
            Missing,
        }

        let now = Instant::now();
        let mut state = self.space(space).state.lock();

        let outcome = match state.entries.get(key) {
            Some(entry) if entry.expired_at(now) => Lookup::Expired,
            Some(entry) => Lookup::Hit(entry.value.clone()),
            None => Lookup::Missing,
        };

        if let Lookup::Expired = outcome {
            if let Some(entry) = state.entries.pop(key) {
                state.memory_bytes = state.memory_bytes.saturating_sub(entry.size_bytes);
                state.expired_removed += 1;
            }
        }
        drop(state);

        match outcome {
            Lookup::Hit(value) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                metrics::CACHE_HITS_TOTAL.inc();
                Some(value)
            }
            Lookup::Expired | Lookup::Missing => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                metrics::CACHE_MISSES_TOTAL.inc();
                None
            }
        }
    }

    /// Store `value` under `key`, evicting least-recently-used entries until
    /// the space's entry and memory budgets hold. A store is never rejected;
    /// a value larger than the whole budget displaces everything else.
    pub fn put(&self, space: CacheSpace, key: &str, value: Vec<u8>, ttl: Duration) {
        let size_bytes = value.len() + key.len() + ENTRY_OVERHEAD_BYTES;
        let now = Instant::now();
        let space_ref = self.space(space);
        let mut state = space_ref.state.lock();

        if let Some(old) = state.entries.pop(key) {
            state.memory_bytes = state.memory_bytes.saturating_sub(old.size_bytes);
        }

        while state.entries.len() + 1 > space_ref.config.max_entries
            || state.memory_bytes + size_bytes > space_ref.config.max_memory_bytes
        {
            match state.entries.pop_lru() {
                Some((_, evicted)) => {
                    state.memory_bytes = state.memory_bytes.saturating_sub(evicted.size_bytes);
                    state.evictions += 1;
                }
                None => break,
            }
        }

        state.entries.put(
            key.to_string(),
            CacheEntry {
                value,
                stored_at: now,
                ttl,
                size_bytes,
            },
        );
        state.memory_bytes += size_bytes;
    }

    /// Drop TTL-expired entries in every space, independent of access
    /// patterns. Bounds memory for cold write-once keys.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0usize;
        for space in self.spaces.values() {
            let mut state = space.state.lock();
            let expired: Vec<String> = state
                .entries
                .iter()
                .filter(|(_, e)| e.expired_at(now))
                .map(|(k, _)| k.clone())
                .collect();
            for key in expired {
                if let Some(entry) = state.entries.pop(&key) {
                    state.memory_bytes = state.memory_bytes.saturating_sub(entry.size_bytes);
                    state.expired_removed += 1;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::debug!(removed, "swept expired cache entries");
        }
        removed
    }

    /// Periodic TTL sweep; stops on [`ResponseCache::shutdown`].
    pub fn start_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cache.sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if cache.shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                        cache.sweep_expired();
                    }
                    _ = cache.shutdown.notified() => break,
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn clear(&self, space: CacheSpace) {
        let mut state = self.space(space).state.lock();
        state.entries.clear();
        state.memory_bytes = 0;
    }

    pub fn clear_all(&self) {
        for space in CacheSpace::ALL {
            self.clear(space);
        }
    }

    /// Reset hit/miss counters. Otherwise they only reset on restart.
    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    fn hit_rate_pct(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hit_rate_pct: self.hit_rate_pct(),
        }
    }

    pub fn detailed_stats(&self) -> CacheDetailedStats {
        let mut spaces = HashMap::new();
        let mut total_entries = 0usize;
        let mut total_bytes = 0usize;
        let mut max_entries = 0usize;
        let mut max_bytes = 0usize;
        for space_id in CacheSpace::ALL {
            let space = self.space(space_id);
            let state = space.state.lock();
            total_entries += state.entries.len();
            total_bytes += state.memory_bytes;
            max_entries += space.config.max_entries;
            max_bytes += space.config.max_memory_bytes;
            spaces.insert(
                space_id.as_str(),
                SpaceStats {
                    entries: state.entries.len(),
                    memory_bytes: state.memory_bytes,
                    evictions: state.evictions,
                    expired_removed: state.expired_removed,
                    max_entries: space.config.max_entries,
                    max_memory_mb: space.config.max_memory_bytes as f64 / (1024.0 * 1024.0),
                },
            );
        }
        let rate = self.hit_rate_pct();
        CacheDetailedStats {
            hit_rate_pct: rate,
            hit_rate_grade: hit_rate_grade(rate),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            total_entries,
            estimated_memory_mb: total_bytes as f64 / (1024.0 * 1024.0),
            max_entries,
            max_memory_mb: max_bytes as f64 / (1024.0 * 1024.0),
            spaces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn tiny_cache(max_entries: usize, max_memory_bytes: usize) -> Arc<ResponseCache> {
        ResponseCache::new(CacheConfig {
            tts_audio: SpaceConfig {
                max_entries,
                max_memory_bytes,
            },
            text: SpaceConfig {
                max_entries,
                max_memory_bytes,
            },
            sweep_interval: Duration::from_secs(30),
        })
    }

    #[test]
    fn put_then_get_round_trips() {
        let cache = tiny_cache(16, 1 << 20);
        cache.put(
            CacheSpace::Text,
            "k1",
            b"transcript".to_vec(),
            Duration::from_secs(60),
        );
        assert_eq!(
            cache.get(CacheSpace::Text, "k1").as_deref(),
            Some(b"transcript".as_ref())
        );
        // Spaces are isolated
        assert!(cache.get(CacheSpace::TtsAudio, "k1").is_none());
    }

    #[test]
    fn expired_entry_reads_as_miss() {
        let cache = tiny_cache(16, 1 << 20);
        cache.put(
            CacheSpace::Text,
            "k",
            b"v".to_vec(),
            Duration::from_millis(0),
        );
        assert!(cache.get(CacheSpace::Text, "k").is_none());
        assert_eq!(cache.detailed_stats().spaces["text"].expired_removed, 1);
    }

    #[test]
    fn entry_budget_evicts_least_recently_used() {
        let cache = tiny_cache(3, 1 << 20);
        for key in ["a", "b", "c"] {
            cache.put(CacheSpace::Text, key, vec![0u8; 8], Duration::from_secs(60));
        }
        // Touch "a" so "b" is the LRU victim
        assert!(cache.get(CacheSpace::Text, "a").is_some());
        cache.put(CacheSpace::Text, "d", vec![0u8; 8], Duration::from_secs(60));

        assert!(cache.get(CacheSpace::Text, "b").is_none());
        assert!(cache.get(CacheSpace::Text, "a").is_some());
        assert!(cache.get(CacheSpace::Text, "c").is_some());
        assert!(cache.get(CacheSpace::Text, "d").is_some());

        let stats = cache.detailed_stats();
        assert!(stats.spaces["text"].entries <= 3);
        assert_eq!(stats.spaces["text"].evictions, 1);
    }

    #[test]
    fn memory_budget_evicts_until_new_entry_fits() {
        // Budget fits roughly two 300-byte values with overhead
        let cache = tiny_cache(100, 800);
        cache.put(CacheSpace::TtsAudio, "a", vec![0u8; 300], Duration::from_secs(60));
        cache.put(CacheSpace::TtsAudio, "b", vec![0u8; 300], Duration::from_secs(60));
        cache.put(CacheSpace::TtsAudio, "c", vec![0u8; 300], Duration::from_secs(60));

        let stats = cache.detailed_stats();
        let space = &stats.spaces["tts_audio"];
        assert!(space.memory_bytes <= 800);
        assert!(space.evictions >= 1);
        // Oldest unaccessed entry went first
        assert!(cache.get(CacheSpace::TtsAudio, "a").is_none());
        assert!(cache.get(CacheSpace::TtsAudio, "c").is_some());
    }

    #[test]
    fn oversized_value_is_still_stored() {
        let cache = tiny_cache(100, 200);
        cache.put(CacheSpace::Text, "small", vec![0u8; 16], Duration::from_secs(60));
        cache.put(CacheSpace::Text, "huge", vec![0u8; 4096], Duration::from_secs(60));
        assert!(cache.get(CacheSpace::Text, "small").is_none());
        assert!(cache.get(CacheSpace::Text, "huge").is_some());
    }

    #[test]
    fn sweep_removes_cold_expired_entries() {
        let cache = tiny_cache(16, 1 << 20);
        cache.put(CacheSpace::Text, "cold", b"x".to_vec(), Duration::from_millis(0));
        cache.put(CacheSpace::Text, "warm", b"y".to_vec(), Duration::from_secs(60));
        let removed = cache.sweep_expired();
        assert_eq!(removed, 1);
        let stats = cache.detailed_stats();
        assert_eq!(stats.spaces["text"].entries, 1);
    }

    #[test]
    fn hit_rate_tracks_hits_and_misses() {
        let cache = tiny_cache(16, 1 << 20);
        cache.put(CacheSpace::Text, "k", b"v".to_vec(), Duration::from_secs(60));
        assert!(cache.get(CacheSpace::Text, "k").is_some());
        assert!(cache.get(CacheSpace::Text, "absent").is_none());
        let stats = cache.detailed_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate_pct - 50.0).abs() < f64::EPSILON);

        cache.reset_stats();
        assert_eq!(cache.detailed_stats().hits, 0);
    }

    #[test]
    fn grades_follow_thresholds() {
        assert_eq!(hit_rate_grade(92.0), "excellent");
        assert_eq!(hit_rate_grade(80.0), "excellent");
        assert_eq!(hit_rate_grade(65.0), "good");
        assert_eq!(hit_rate_grade(40.0), "fair");
        assert_eq!(hit_rate_grade(12.5), "poor");
    }
}
