use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use interview_perf::config::PoolConfig;
use interview_perf::pool::{AcquireOutcome, ConnectionPool};

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_burst_never_exceeds_host_limit() {
    let pool = ConnectionPool::new(PoolConfig {
        max_per_host: 5,
        max_concurrent_requests: 100,
        idle_timeout: Duration::from_secs(60),
        reap_interval: Duration::from_secs(10),
    });

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let mut joins = Vec::new();
    for _ in 0..60 {
        let pool = Arc::clone(&pool);
        let active = Arc::clone(&active);
        let peak = Arc::clone(&peak);
        joins.push(tokio::spawn(async move {
            loop {
                match pool.acquire("stt.upstream") {
                    AcquireOutcome::Acquired(slot) => {
                        let now_active = active.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now_active, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        pool.release(slot);
                        break;
                    }
                    AcquireOutcome::Busy => tokio::time::sleep(Duration::from_millis(1)).await,
                }
            }
        }));
    }
    for join in joins {
        join.await.unwrap();
    }

    assert!(
        peak.load(Ordering::SeqCst) <= 5,
        "active connections exceeded per-host max: {}",
        peak.load(Ordering::SeqCst)
    );

    let stats = pool.stats();
    let host = &stats.per_host["stt.upstream"];
    assert!(host.total_connections <= 5);
    assert_eq!(stats.active_requests, 0);
    // 60 acquisitions through at most 5 connections means heavy reuse
    assert_eq!(stats.total_acquisitions, 60);
    assert!(stats.reused_acquisitions >= 55);
}

#[tokio::test]
async fn reaper_task_prunes_idle_connections() {
    let pool = ConnectionPool::new(PoolConfig {
        max_per_host: 4,
        max_concurrent_requests: 10,
        idle_timeout: Duration::from_millis(30),
        reap_interval: Duration::from_millis(20),
    });
    let reaper = pool.start_reaper();

    let slot = match pool.acquire("tts.upstream") {
        AcquireOutcome::Acquired(slot) => slot,
        AcquireOutcome::Busy => panic!("fresh pool must not be busy"),
    };
    pool.release(slot);

    tokio::time::sleep(Duration::from_millis(150)).await;

    let stats = pool.stats();
    let host = &stats.per_host["tts.upstream"];
    assert_eq!(host.idle_connections, 0, "idle entry should be reaped");
    assert_eq!(host.total_connections, 1, "historical count survives");

    // A new acquire after reaping opens a second connection
    match pool.acquire("tts.upstream") {
        AcquireOutcome::Acquired(_) => {}
        AcquireOutcome::Busy => panic!("pool should have capacity after reap"),
    }
    assert_eq!(
        pool.stats().per_host["tts.upstream"].total_connections,
        2
    );

    pool.shutdown();
    let _ = reaper.await;
}
