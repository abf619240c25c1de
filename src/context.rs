//! Composition of the three components per outbound call
//!
//! Control flow: cache lookup first; a hit returns with zero queue/pool
//! involvement. A miss goes through the matching named queue, which enforces
//! admission control and concurrency, acquires a pool slot, runs the
//! upstream call, stores the response in the cache and hands the result
//! back. The cache store happens inside the dispatched work, so a call that
//! outlives its caller's deadline still populates the cache for the next
//! caller.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::cache::{CacheSpace, ResponseCache};
use crate::config::PerfConfig;
use crate::error::PerfResult;
use crate::pool::ConnectionPool;
use crate::queue::{QueueClass, RequestQueueManager};

/// Seam to the excluded service adapters: one call per service class.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    async fn invoke(&self, payload: Vec<u8>) -> PerfResult<Vec<u8>>;
}

/// Process-wide handle to the performance layer. Constructed once and
/// injected into callers; all counters live inside the components and are
/// exposed only through their accessor calls.
#[derive(Clone)]
pub struct PerfContext {
    pub pool: Arc<ConnectionPool>,
    pub queues: Arc<RequestQueueManager>,
    pub cache: Arc<ResponseCache>,
}

impl PerfContext {
    pub fn new(config: &PerfConfig) -> Self {
        let pool = ConnectionPool::new(config.pool.clone());
        let queues = RequestQueueManager::new(config.queues.clone(), Arc::clone(&pool));
        let cache = ResponseCache::new(config.cache.clone());
        Self { pool, queues, cache }
    }

    /// Start the queue dispatchers, the idle-connection reaper and the TTL
    /// sweep. Returns the task handles; `shutdown` stops them all.
    pub fn start_background(&self) -> Vec<JoinHandle<()>> {
        let mut handles = self.queues.start();
        handles.push(self.pool.start_reaper());
        handles.push(self.cache.start_sweeper());
        handles
    }

    pub fn shutdown(&self) {
        self.queues.shutdown();
        self.pool.shutdown();
        self.cache.shutdown();
        tracing::info!("performance layer shut down");
    }

    /// Execute one upstream call through the full cache -> queue -> pool
    /// path. `key` must already be a normalized fingerprint (see
    /// [`crate::cache::keys`]).
    pub async fn execute<F, Fut>(
        &self,
        class: QueueClass,
        space: CacheSpace,
        key: String,
        ttl: Duration,
        deadline: Duration,
        invoke: F,
    ) -> PerfResult<Vec<u8>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = PerfResult<Vec<u8>>> + Send + 'static,
    {
        if let Some(value) = self.cache.get(space, &key) {
            tracing::debug!(queue = %class, space = %space, "served from cache");
            return Ok(value);
        }

        let cache = Arc::clone(&self.cache);
        self.queues
            .submit(
                class,
                move || async move {
                    let value = invoke().await?;
                    // Upstream errors are never cached
                    cache.put(space, &key, value.clone(), ttl);
                    Ok(value)
                },
                deadline,
            )
            .await
    }

    /// `execute` with a boxed adapter, for callers that hold the service
    /// seam as a trait object.
    pub async fn call_upstream(
        &self,
        class: QueueClass,
        space: CacheSpace,
        key: String,
        ttl: Duration,
        deadline: Duration,
        adapter: Arc<dyn UpstreamAdapter>,
        payload: Vec<u8>,
    ) -> PerfResult<Vec<u8>> {
        self.execute(class, space, key, ttl, deadline, move || async move {
            adapter.invoke(payload).await
        })
        .await
    }
}
