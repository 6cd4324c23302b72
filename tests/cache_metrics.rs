use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    body::Body,
    extract::Path,
    http::{Method, Request, StatusCode},
    middleware,
    routing::get,
};
use metrics_util::debugging::{DebugValue, DebuggingRecorder};
use roundcache::cache::{
    CacheConfig, CacheState, FixedRoundClock, METRIC_CACHED_HIT_TOTAL, METRIC_PENDING_HIT_TOTAL,
    METRIC_PENDING_REQUESTS, response_cache_layer,
};
use roundcache::infra::telemetry;
use time::OffsetDateTime;
use tower::ServiceExt;

#[tokio::test]
async fn cache_paths_emit_expected_metrics() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    telemetry::describe_metrics();

    let clock = Arc::new(FixedRoundClock::new(
        OffsetDateTime::now_utc(),
        Duration::from_secs(3600),
    ));
    let cache_state = CacheState::in_memory(CacheConfig::default(), clock);

    let calls = Arc::new(AtomicUsize::new(0));
    let app = Router::new()
        .route(
            "/blocks/{height}",
            get(move |Path(height): Path<u64>| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    format!("block {height}")
                }
            }),
        )
        .layer(middleware::from_fn_with_state(
            cache_state.clone(),
            response_cache_layer,
        ));

    let send = |uri: &'static str| {
        let app = app.clone();
        tokio::spawn(async move {
            let request = Request::builder()
                .method(Method::GET)
                .uri(uri)
                .body(Body::empty())
                .expect("request should build");
            let response = app.oneshot(request).await.expect("router should respond");
            assert_eq!(response.status(), StatusCode::OK);
        })
    };

    // Two concurrent requests: one computes, one joins.
    let first = send("/blocks/7");
    let second = send("/blocks/7");
    first.await.expect("request task should finish");
    second.await.expect("request task should finish");

    // Served from the store.
    send("/blocks/7").await.expect("request task should finish");

    assert_eq!(cache_state.cache.pending_count(), 0);

    let mut gauges = HashMap::new();
    let mut counters = HashMap::new();
    for (composite_key, _, description, value) in snapshotter.snapshot().into_vec() {
        let key = composite_key.key();
        assert!(
            description.is_some(),
            "metric without description: {}",
            key.name()
        );

        let operation = key
            .labels()
            .find(|label| label.key() == "operation")
            .map(|label| label.value().to_string());

        match value {
            DebugValue::Gauge(gauge) => {
                gauges.insert(key.name().to_string(), gauge.0);
            }
            DebugValue::Counter(count) => {
                counters.insert((key.name().to_string(), operation), count);
            }
            DebugValue::Histogram(_) => {}
        }
    }

    assert_eq!(gauges.get(METRIC_PENDING_REQUESTS), Some(&0.0));

    let label = Some("/blocks/{height}".to_string());
    assert_eq!(
        counters.get(&(METRIC_PENDING_HIT_TOTAL.to_string(), label.clone())),
        Some(&1)
    );
    assert_eq!(
        counters.get(&(METRIC_CACHED_HIT_TOTAL.to_string(), label)),
        Some(&1)
    );
}
