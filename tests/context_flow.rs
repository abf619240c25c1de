use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use interview_perf::cache::{keys, CacheSpace};
use interview_perf::config::PerfConfig;
use interview_perf::error::PerfError;
use interview_perf::queue::QueueClass;
use interview_perf::PerfContext;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_tts_requests_serve_second_from_cache() {
    let ctx = PerfContext::new(&PerfConfig::default());
    let _background = ctx.start_background();

    let key = keys::tts_key("Please describe your last project.", "en-US-standard-1");
    let upstream_calls = Arc::new(AtomicUsize::new(0));

    for round in 0..2 {
        let calls = Arc::clone(&upstream_calls);
        let value = ctx
            .execute(
                QueueClass::Tts,
                CacheSpace::TtsAudio,
                key.clone(),
                Duration::from_secs(60),
                Duration::from_secs(5),
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(b"audio-bytes".to_vec())
                },
            )
            .await
            .unwrap();
        assert_eq!(value, b"audio-bytes".to_vec(), "round {round}");
    }

    assert_eq!(
        upstream_calls.load(Ordering::SeqCst),
        1,
        "second request must not reach the upstream"
    );

    let cache_stats = ctx.cache.detailed_stats();
    assert_eq!(cache_stats.hits, 1);
    assert_eq!(cache_stats.misses, 1);

    // Zero queue/pool involvement for the hit: only one item ever completed
    let queue_stats = ctx.queues.detailed_stats();
    assert_eq!(queue_stats.queues["tts"].completed_total, 1);
    assert_eq!(ctx.pool.stats().total_acquisitions, 1);

    ctx.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upstream_errors_propagate_and_are_not_cached() {
    let ctx = PerfContext::new(&PerfConfig::default());
    let _background = ctx.start_background();

    let key = keys::llm_key(
        "Score this answer",
        &serde_json::json!({"model": "scorer-v2", "temperature": 0.0}),
    );

    let result = ctx
        .execute(
            QueueClass::Llm,
            CacheSpace::Text,
            key.clone(),
            Duration::from_secs(60),
            Duration::from_secs(5),
            || async { Err(PerfError::upstream("model unavailable")) },
        )
        .await;
    match result {
        Err(PerfError::Upstream { message }) => assert!(message.contains("model unavailable")),
        other => panic!("expected Upstream error, got {other:?}"),
    }

    // The failure was not cached; a retry reaches the upstream and succeeds
    let retried = ctx
        .execute(
            QueueClass::Llm,
            CacheSpace::Text,
            key,
            Duration::from_secs(60),
            Duration::from_secs(5),
            || async { Ok(b"4/5".to_vec()) },
        )
        .await
        .unwrap();
    assert_eq!(retried, b"4/5".to_vec());

    ctx.shutdown();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn late_completion_still_populates_the_cache() {
    let ctx = PerfContext::new(&PerfConfig::default());
    let _background = ctx.start_background();

    let key = keys::stt_key(b"candidate-answer-opus-frames");

    // Deadline far shorter than the upstream call
    let result = ctx
        .execute(
            QueueClass::Stt,
            CacheSpace::Text,
            key.clone(),
            Duration::from_secs(60),
            Duration::from_millis(50),
            || async {
                tokio::time::sleep(Duration::from_millis(250)).await;
                Ok(b"transcript".to_vec())
            },
        )
        .await;
    assert!(matches!(result, Err(PerfError::Timeout { .. })));

    // The in-flight call was not cancelled; once it finishes, its result is
    // available from the cache
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        ctx.cache.get(CacheSpace::Text, &key).as_deref(),
        Some(b"transcript".as_ref())
    );

    ctx.shutdown();
}
