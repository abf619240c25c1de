// src/config.rs
use std::env;
use std::time::Duration;

use crate::queue::QueueClass;

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let host = env::var("PERF_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("PERF_PORT")
            .unwrap_or_else(|_| "3020".to_string())
            .parse()
            .expect("PERF_PORT must be a valid u16");
        Self { host, port }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection pool limits and reaping cadence
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Per-host ceiling on concurrently checked-out connections
    pub max_per_host: usize,
    /// Global ceiling across all hosts
    pub max_concurrent_requests: usize,
    /// Idle connections older than this are reaped
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_per_host: 25,
            max_concurrent_requests: 100,
            idle_timeout: Duration::from_secs(60),
            reap_interval: Duration::from_secs(10),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self {
            max_per_host: env_usize("POOL_MAX_PER_HOST", 25),
            max_concurrent_requests: env_usize("POOL_MAX_CONCURRENT", 100),
            idle_timeout: Duration::from_secs(env_u64("POOL_IDLE_TIMEOUT_SECS", 60)),
            reap_interval: Duration::from_secs(env_u64("POOL_REAP_INTERVAL_SECS", 10)),
        }
    }
}

/// Per-class queue limits plus the upstream host the class dispatches to
#[derive(Debug, Clone)]
pub struct QueueClassConfig {
    pub host: String,
    pub max_concurrency: usize,
    pub max_pending: usize,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub stt: QueueClassConfig,
    pub tts: QueueClassConfig,
    pub llm: QueueClassConfig,
    /// pending/max_pending ratio at which `is_high_load` latches on
    pub high_load_ratio: f64,
    /// How long a queue must sit pinned at max-concurrency with a backlog
    /// before that alone counts as high load
    pub saturation_grace: Duration,
    /// Backoff between pool `Busy` retries for the head-of-line item
    pub busy_backoff: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            stt: QueueClassConfig {
                host: "stt.upstream".to_string(),
                max_concurrency: 25,
                max_pending: 75,
            },
            tts: QueueClassConfig {
                host: "tts.upstream".to_string(),
                max_concurrency: 25,
                max_pending: 100,
            },
            llm: QueueClassConfig {
                host: "llm.upstream".to_string(),
                max_concurrency: 10,
                max_pending: 50,
            },
            high_load_ratio: 0.8,
            saturation_grace: Duration::from_secs(10),
            busy_backoff: Duration::from_millis(25),
        }
    }
}

impl QueueConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let class = |prefix: &str, d: &QueueClassConfig| QueueClassConfig {
            host: env::var(format!("{prefix}_HOST")).unwrap_or_else(|_| d.host.clone()),
            max_concurrency: env_usize(&format!("{prefix}_MAX_CONCURRENCY"), d.max_concurrency),
            max_pending: env_usize(&format!("{prefix}_MAX_PENDING"), d.max_pending),
        };
        Self {
            stt: class("QUEUE_STT", &defaults.stt),
            tts: class("QUEUE_TTS", &defaults.tts),
            llm: class("QUEUE_LLM", &defaults.llm),
            high_load_ratio: env_f64("QUEUE_HIGH_LOAD_RATIO", defaults.high_load_ratio),
            saturation_grace: Duration::from_secs(env_u64("QUEUE_SATURATION_GRACE_SECS", 10)),
            busy_backoff: Duration::from_millis(env_u64("QUEUE_BUSY_BACKOFF_MS", 25)),
        }
    }

    pub fn class(&self, class: QueueClass) -> &QueueClassConfig {
        match class {
            QueueClass::Stt => &self.stt,
            QueueClass::Tts => &self.tts,
            QueueClass::Llm => &self.llm,
        }
    }
}

/// Entry-count and memory budget for one cache space
#[derive(Debug, Clone)]
pub struct SpaceConfig {
    pub max_entries: usize,
    pub max_memory_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Synthesized audio responses (large values, few entries)
    pub tts_audio: SpaceConfig,
    /// Transcripts and model completions (small values, many entries)
    pub text: SpaceConfig,
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            tts_audio: SpaceConfig {
                max_entries: 500,
                max_memory_bytes: 256 * 1024 * 1024,
            },
            text: SpaceConfig {
                max_entries: 2000,
                max_memory_bytes: 64 * 1024 * 1024,
            },
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            tts_audio: SpaceConfig {
                max_entries: env_usize("CACHE_TTS_MAX_ENTRIES", defaults.tts_audio.max_entries),
                max_memory_bytes: env_usize("CACHE_TTS_MAX_MEMORY_MB", 256) * 1024 * 1024,
            },
            text: SpaceConfig {
                max_entries: env_usize("CACHE_TEXT_MAX_ENTRIES", defaults.text.max_entries),
                max_memory_bytes: env_usize("CACHE_TEXT_MAX_MEMORY_MB", 64) * 1024 * 1024,
            },
            sweep_interval: Duration::from_secs(env_u64("CACHE_SWEEP_INTERVAL_SECS", 30)),
        }
    }
}

/// Top-level configuration, one per process
#[derive(Debug, Clone, Default)]
pub struct PerfConfig {
    pub api: ApiConfig,
    pub pool: PoolConfig,
    pub queues: QueueConfig,
    pub cache: CacheConfig,
}

impl PerfConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            api: ApiConfig::from_env(),
            pool: PoolConfig::from_env(),
            queues: QueueConfig::from_env(),
            cache: CacheConfig::from_env(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3020,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_consistent() {
        let cfg = QueueConfig::default();
        assert_eq!(cfg.class(QueueClass::Stt).max_pending, 75);
        assert_eq!(cfg.class(QueueClass::Llm).max_concurrency, 10);
        assert!(cfg.high_load_ratio > 0.0 && cfg.high_load_ratio < 1.0);
    }

    #[test]
    fn pool_defaults_cover_queue_concurrency() {
        let pool = PoolConfig::default();
        let queues = QueueConfig::default();
        // Every class must be able to reach its own concurrency through the pool
        for class in QueueClass::ALL {
            assert!(queues.class(class).max_concurrency <= pool.max_per_host);
        }
    }
}
