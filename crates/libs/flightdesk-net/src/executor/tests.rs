use super::*;
use serde_json::json;
use std::sync::atomic::AtomicUsize;

fn executor() -> RequestExecutor {
    RequestExecutor::with_backoff(&RequestConfig::default(), BackoffScheduler::without_jitter())
}

async fn let_tasks_run() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

/// Sleeps for `delay`, ignoring cancellation, then echoes the first argument.
fn slow_echo(delay: Duration, calls: Arc<AtomicUsize>) -> Arc<dyn Operation> {
    Arc::new(move |args: Vec<Value>, _cancel: CancellationToken| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            Ok::<_, NetError>(args.first().cloned().unwrap_or(Value::Null))
        }
    })
}

fn failing(status: u16, calls: Arc<AtomicUsize>) -> Arc<dyn Operation> {
    Arc::new(move |_args: Vec<Value>, _cancel: CancellationToken| {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<Value, _>(NetError::from_status(status, "upstream said no"))
        }
    })
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn superseded_result_does_not_overwrite_newer_state() {
    let executor = executor();
    let ctx = executor.context();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ExecuteOptions::default().with_cache(false);

    let first = {
        let ctx = ctx.clone();
        let operation = slow_echo(Duration::from_millis(200), Arc::clone(&calls));
        let options = options.clone();
        tokio::spawn(async move {
            ctx.execute("flights.search", operation, vec![json!("LHR")], &options).await
        })
    };
    let_tasks_run().await;
    assert!(ctx.is_loading());

    let second = ctx
        .execute(
            "flights.search",
            slow_echo(Duration::from_millis(10), Arc::clone(&calls)),
            vec![json!("JFK")],
            &options,
        )
        .await
        .expect("second call");
    assert_eq!(second, Some(json!("JFK")));

    let first = first.await.expect("join first call").expect("first call settles quietly");
    assert_eq!(first, None, "stale call must resolve to a no-op");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(ctx.data(), Some(json!("JFK")));
    assert_eq!(ctx.error(), None);
    assert!(!ctx.is_loading());
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn concurrent_identical_calls_share_one_invocation() {
    let executor = executor();
    let calls = Arc::new(AtomicUsize::new(0));
    let operation = slow_echo(Duration::from_millis(50), Arc::clone(&calls));
    let options = ExecuteOptions::default().with_cache(false);
    let left = executor.context();
    let right = executor.context();

    let (a, b) = tokio::join!(
        left.execute("airlines.list", Arc::clone(&operation), vec![json!({"page": 1})], &options),
        right.execute("airlines.list", Arc::clone(&operation), vec![json!({"page": 1})], &options),
    );

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a.expect("left"), Some(json!({"page": 1})));
    assert_eq!(b.expect("right"), Some(json!({"page": 1})));
    assert_eq!(executor.in_flight_count(), 0);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn cache_hit_skips_the_operation_until_invalidated() {
    let executor = executor();
    let ctx = executor.context();
    let calls = Arc::new(AtomicUsize::new(0));
    let operation = slow_echo(Duration::from_millis(5), Arc::clone(&calls));
    let options = ExecuteOptions::default();

    for _ in 0..3 {
        let value = ctx
            .execute("GET /airports", Arc::clone(&operation), vec![json!({"country": "NO"})], &options)
            .await
            .expect("execute");
        assert_eq!(value, Some(json!({"country": "NO"})));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(executor.cache_stats().entry_count, 1);

    assert_eq!(executor.invalidate(&Invalidation::Prefix("GET /airports".into())), 1);
    ctx.execute("GET /airports", Arc::clone(&operation), vec![json!({"country": "NO"})], &options)
        .await
        .expect("execute after invalidation");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn expired_cache_entry_triggers_a_new_call() {
    let executor = executor();
    let ctx = executor.context();
    let calls = Arc::new(AtomicUsize::new(0));
    let operation = slow_echo(Duration::ZERO, Arc::clone(&calls));
    let options = ExecuteOptions::default().with_cache_ttl(Duration::from_millis(100));

    ctx.execute("crew.roster", Arc::clone(&operation), vec![], &options).await.expect("first");
    tokio::time::advance(Duration::from_millis(50)).await;
    ctx.execute("crew.roster", Arc::clone(&operation), vec![], &options).await.expect("cached");
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    tokio::time::advance(Duration::from_millis(100)).await;
    ctx.execute("crew.roster", Arc::clone(&operation), vec![], &options).await.expect("expired");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn client_errors_are_not_retried() {
    let executor = executor();
    let ctx = executor.context();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ExecuteOptions::default().with_retry_attempts(3);

    let err = ctx
        .execute("GET /aircraft/9", failing(404, Arc::clone(&calls)), vec![], &options)
        .await
        .expect_err("404 surfaces");

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(err.status(), Some(404));
    assert_eq!(ctx.error(), Some(err));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn transient_errors_are_retried_up_to_the_limit() {
    let executor = executor();
    let ctx = executor.context();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ExecuteOptions::default().with_retry_attempts(2);

    let err = ctx
        .execute("GET /routes", failing(503, Arc::clone(&calls)), vec![], &options)
        .await
        .expect_err("503 surfaces after retries");

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(err.is_retryable());
    assert_eq!(err.status(), Some(503));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn exhausted_retries_leave_error_and_clear_loading() {
    let executor = executor();
    let ctx = executor.context();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ExecuteOptions::default().with_cache(false).with_retry_attempts(3);
    let started = Instant::now();

    let operation: Arc<dyn Operation> = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_args: Vec<Value>, _cancel: CancellationToken| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(NetError::transient("connection reset"))
            }
        })
    };
    let err = ctx.execute("GET /flights", operation, vec![], &options).await.expect_err("fails");

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(err, NetError::transient("connection reset"));
    assert_eq!(ctx.error(), Some(err));
    assert!(!ctx.is_loading());
    assert_eq!(ctx.active_invocation(), None);
    // 1s + 2s + 4s of backoff without jitter.
    assert!(started.elapsed() >= Duration::from_secs(7));
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn retry_recovers_once_the_service_comes_back() {
    let executor = executor();
    let ctx = executor.context();
    let calls = Arc::new(AtomicUsize::new(0));
    let operation: Arc<dyn Operation> = {
        let calls = Arc::clone(&calls);
        Arc::new(move |_args: Vec<Value>, _cancel: CancellationToken| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(NetError::from_status(502, "bad gateway"))
                } else {
                    Ok(json!({"flights": []}))
                }
            }
        })
    };

    let value = ctx
        .execute("GET /flights", operation, vec![], &ExecuteOptions::default())
        .await
        .expect("recovers");
    assert_eq!(value, Some(json!({"flights": []})));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(ctx.error(), None);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn explicit_cancel_is_a_silent_no_op() {
    let executor = executor();
    let ctx = executor.context();
    let observed_abort = Arc::new(AtomicUsize::new(0));
    let operation: Arc<dyn Operation> = {
        let observed_abort = Arc::clone(&observed_abort);
        Arc::new(move |_args: Vec<Value>, cancel: CancellationToken| {
            let observed_abort = Arc::clone(&observed_abort);
            async move {
                cancel.cancelled().await;
                observed_abort.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(NetError::Aborted)
            }
        })
    };

    let pending = {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            ctx.execute("GET /crew", operation, vec![], &ExecuteOptions::default()).await
        })
    };
    let_tasks_run().await;
    ctx.cancel();

    assert_eq!(pending.await.expect("join"), Ok(None));
    assert!(!ctx.is_loading());
    assert_eq!(ctx.error(), None);
    assert_eq!(ctx.data(), None);
    let_tasks_run().await;
    assert_eq!(executor.in_flight_count(), 0);
    assert_eq!(observed_abort.load(Ordering::SeqCst), 0, "request future is dropped, not polled to completion");
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn debounce_collapses_rapid_calls_into_the_last_one() {
    let executor = executor();
    let ctx = executor.context();
    let calls = Arc::new(AtomicUsize::new(0));
    let operation = slow_echo(Duration::from_millis(1), Arc::clone(&calls));
    let options = ExecuteOptions::default().with_debounce(Some(Duration::from_millis(300)));

    let first = {
        let ctx = ctx.clone();
        let operation = Arc::clone(&operation);
        let options = options.clone();
        tokio::spawn(async move { ctx.execute("search", operation, vec![json!("LO")], &options).await })
    };
    let_tasks_run().await;
    tokio::time::advance(Duration::from_millis(100)).await;

    let last = ctx.execute("search", operation, vec![json!("LON")], &options).await;
    assert_eq!(last, Ok(Some(json!("LON"))));
    assert_eq!(first.await.expect("join"), Ok(None));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn follower_reissues_when_the_owning_context_aborts() {
    let executor = executor();
    let calls = Arc::new(AtomicUsize::new(0));
    let operation = slow_echo(Duration::from_millis(50), Arc::clone(&calls));
    let options = ExecuteOptions::default().with_cache(false);
    let owner = executor.context();
    let follower = executor.context();

    let owned = {
        let owner = owner.clone();
        let operation = Arc::clone(&operation);
        let options = options.clone();
        tokio::spawn(async move { owner.execute("GET /routes", operation, vec![], &options).await })
    };
    let_tasks_run().await;
    let followed = {
        let follower = follower.clone();
        let operation = Arc::clone(&operation);
        let options = options.clone();
        tokio::spawn(async move { follower.execute("GET /routes", operation, vec![], &options).await })
    };
    let_tasks_run().await;
    assert_eq!(executor.in_flight_count(), 1);

    owner.cancel();

    assert_eq!(owned.await.expect("join owner"), Ok(None));
    assert_eq!(followed.await.expect("join follower"), Ok(Some(Value::Null)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn execute_as_reports_decode_failures_with_payload() {
    let executor = executor();
    let ctx = executor.context();
    let operation: Arc<dyn Operation> = Arc::new(|_args: Vec<Value>, _cancel: CancellationToken| async {
        Ok::<_, NetError>(json!({"id": "not-a-number"}))
    });

    #[derive(Debug, serde::Deserialize)]
    struct Airline {
        #[allow(dead_code)]
        id: u32,
    }

    let err = ctx
        .execute_as::<Airline>("GET /airlines/1", operation, vec![], &ExecuteOptions::default())
        .await
        .expect_err("decode fails");
    match err {
        NetError::Decode { payload, .. } => assert!(payload.contains("not-a-number")),
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn cache_key_is_stable_for_equal_arguments() {
    let a = cache_key("GET /flights", &[json!({"from": "OSL", "to": "BGO"})]);
    let b = cache_key("GET /flights", &[json!({"to": "BGO", "from": "OSL"})]);
    assert_eq!(a, b);
    assert_eq!(a, r#"GET /flights:[{"from":"OSL","to":"BGO"}]"#);
    assert_ne!(a, cache_key("GET /flights", &[json!({"from": "OSL"})]));
    assert_ne!(cache_key("a", &[json!("b:c")]), cache_key("a:b", &[json!("c")]));
}

#[test]
fn options_follow_request_config() {
    let config = RequestConfig {
        cache_enabled: false,
        cache_ttl_ms: 1_000,
        retry_attempts: 1,
        retry_delay_ms: 250,
        debounce_delay_ms: 300,
    };
    let options = ExecuteOptions::from(&config);
    assert!(!options.cache);
    assert_eq!(options.retry_attempts, 1);
    assert_eq!(options.retry_delay, Duration::from_millis(250));
    assert_eq!(options.debounce, Some(Duration::from_millis(300)));
    assert_eq!(RequestExecutor::new(&config).defaults(), &options);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn invalidation_mid_flight_keeps_the_older_result_out_of_cache() {
    let executor = executor();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = ExecuteOptions::default();

    let pending = {
        let ctx = executor.context();
        let operation = slow_echo(Duration::from_millis(200), Arc::clone(&calls));
        let options = options.clone();
        tokio::spawn(async move { ctx.execute("airlines.list", operation, vec![json!("v1")], &options).await })
    };
    let_tasks_run().await;
    assert_eq!(executor.invalidate(&Invalidation::Prefix("airlines.".into())), 0);

    // Arrives after the invalidation, so it does not join the older call.
    let late = executor
        .context()
        .execute("airlines.list", slow_echo(Duration::from_millis(200), Arc::clone(&calls)), vec![json!("v1")], &options)
        .await;
    assert_eq!(pending.await.expect("join"), Ok(Some(json!("v1"))));
    assert_eq!(late, Ok(Some(json!("v1"))));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(executor.cache_stats().entry_count, 1);

    executor.clear_cache();
    let stale = {
        let ctx = executor.context();
        let operation = slow_echo(Duration::from_millis(200), Arc::clone(&calls));
        let options = options.clone();
        tokio::spawn(async move { ctx.execute("airlines.list", operation, vec![json!("v2")], &options).await })
    };
    let_tasks_run().await;
    executor.clear_cache();
    assert_eq!(stale.await.expect("join"), Ok(Some(json!("v2"))));
    assert_eq!(executor.cache_stats().entry_count, 0);
}
