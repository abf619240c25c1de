//! Connection Pool Manager
//!
//! Owns a bounded set of reusable outbound connection slots per upstream
//! host. `acquire` hands out an idle slot, creates one while the host is
//! under its ceiling, or answers `Busy`. `Busy` is a capacity signal for the
//! dispatcher (enqueue vs. reject), not an error. No retries happen here;
//! retry policy belongs to the Request Queue Manager.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::config::PoolConfig;

/// One reusable outbound connection to one host.
///
/// Never handed to two concurrent callers: `in_use` flips under the pool
/// mutex and only `release` clears it.
#[derive(Debug)]
struct PoolEntry {
    id: u64,
    created_at: Instant,
    last_used: Instant,
    in_use: bool,
}

#[derive(Debug, Default)]
struct HostPool {
    entries: Vec<PoolEntry>,
    /// Connections ever created for this host, reaped ones included
    total_created: u64,
}

impl HostPool {
    fn active(&self) -> usize {
        self.entries.iter().filter(|e| e.in_use).count()
    }
}

/// Handle for one checked-out connection slot. Must be handed back via
/// [`ConnectionPool::release`]; the dispatcher owns that lifecycle.
#[derive(Debug)]
pub struct PoolSlot {
    pub host: String,
    entry_id: u64,
}

/// Outcome of an acquire attempt
#[derive(Debug)]
pub enum AcquireOutcome {
    Acquired(PoolSlot),
    /// No slot available; caller decides enqueue vs. reject
    Busy,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostPoolStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub idle_connections: usize,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub per_host: HashMap<String, HostPoolStats>,
    pub active_requests: usize,
    pub max_concurrent_requests: usize,
    pub total_acquisitions: u64,
    pub reused_acquisitions: u64,
    /// reused / total acquisitions; the share of acquires served without
    /// opening a new connection
    pub reuse_rate_pct: f64,
}

pub struct ConnectionPool {
    config: PoolConfig,
    hosts: Mutex<HashMap<String, HostPool>>,
    next_entry_id: AtomicU64,
    total_acquisitions: AtomicU64,
    reused_acquisitions: AtomicU64,
    shutdown: Notify,
    shutting_down: AtomicBool,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            hosts: Mutex::new(HashMap::new()),
            next_entry_id: AtomicU64::new(1),
            total_acquisitions: AtomicU64::new(0),
            reused_acquisitions: AtomicU64::new(0),
            shutdown: Notify::new(),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Hand out a slot for `host`: an idle entry if one exists, a fresh one
    /// while the host and global ceilings permit, otherwise `Busy`.
    pub fn acquire(&self, host: &str) -> AcquireOutcome {
        let now = Instant::now();
        let mut hosts = self.hosts.lock();

        let active_total: usize = hosts.values().map(|h| h.active()).sum();
        if active_total >= self.config.max_concurrent_requests {
            return AcquireOutcome::Busy;
        }

        let pool = hosts.entry(host.to_string()).or_default();

        if let Some(entry) = pool.entries.iter_mut().find(|e| !e.in_use) {
            entry.in_use = true;
            entry.last_used = now;
            let slot = PoolSlot {
                host: host.to_string(),
                entry_id: entry.id,
            };
            self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
            self.reused_acquisitions.fetch_add(1, Ordering::Relaxed);
            return AcquireOutcome::Acquired(slot);
        }

        if pool.active() >= self.config.max_per_host {
            return AcquireOutcome::Busy;
        }

        let id = self.next_entry_id.fetch_add(1, Ordering::Relaxed);
        pool.entries.push(PoolEntry {
            id,
            created_at: now,
            last_used: now,
            in_use: true,
        });
        pool.total_created += 1;
        self.total_acquisitions.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(host, entry_id = id, "opened new pool connection");

        AcquireOutcome::Acquired(PoolSlot {
            host: host.to_string(),
            entry_id: id,
        })
    }

    /// Mark the slot idle again and stamp last-used for the reaper.
    pub fn release(&self, slot: PoolSlot) {
        let mut hosts = self.hosts.lock();
        if let Some(pool) = hosts.get_mut(&slot.host) {
            if let Some(entry) = pool.entries.iter_mut().find(|e| e.id == slot.entry_id) {
                entry.in_use = false;
                entry.last_used = Instant::now();
            }
        }
    }

    /// Drop idle entries past the idle timeout. Bounds per-host connection
    /// count after a burst subsides.
    fn reap_idle(&self) {
        let idle_timeout = self.config.idle_timeout;
        let mut hosts = self.hosts.lock();
        let mut reaped = 0usize;
        for pool in hosts.values_mut() {
            let before = pool.entries.len();
            pool.entries
                .retain(|e| e.in_use || e.last_used.elapsed() < idle_timeout);
            reaped += before - pool.entries.len();
        }
        if reaped > 0 {
            tracing::debug!(reaped, "reaped idle pool connections");
        }
    }

    /// Periodic idle-connection reaper; stops on [`ConnectionPool::shutdown`].
    pub fn start_reaper(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.reap_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if pool.shutting_down.load(Ordering::SeqCst) {
                            break;
                        }
                        pool.reap_idle();
                    }
                    _ = pool.shutdown.notified() => break,
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.shutdown.notify_waiters();
    }

    pub fn stats(&self) -> PoolStats {
        let hosts = self.hosts.lock();
        let per_host: HashMap<String, HostPoolStats> = hosts
            .iter()
            .map(|(host, pool)| {
                let active = pool.active();
                (
                    host.clone(),
                    HostPoolStats {
                        total_connections: pool.total_created,
                        active_connections: active,
                        idle_connections: pool.entries.len() - active,
                        max_concurrent: self.config.max_per_host,
                    },
                )
            })
            .collect();
        let active_requests = per_host.values().map(|h| h.active_connections).sum();
        let total = self.total_acquisitions.load(Ordering::Relaxed);
        let reused = self.reused_acquisitions.load(Ordering::Relaxed);
        let reuse_rate_pct = if total == 0 {
            0.0
        } else {
            reused as f64 / total as f64 * 100.0
        };
        PoolStats {
            per_host,
            active_requests,
            max_concurrent_requests: self.config.max_concurrent_requests,
            total_acquisitions: total,
            reused_acquisitions: reused,
            reuse_rate_pct,
        }
    }

    /// Age of the oldest live connection, for the report payload.
    pub fn oldest_connection_age_secs(&self) -> Option<u64> {
        let hosts = self.hosts.lock();
        hosts
            .values()
            .flat_map(|p| p.entries.iter())
            .map(|e| e.created_at.elapsed().as_secs())
            .max()
    }
}
