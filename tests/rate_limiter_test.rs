use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{advance, Instant};
use turnstile::endpoint::{
    Admission, BreakerConfig, EndpointConfig, PacingConfig, RateLimiter, WindowKind, UNLIMITED,
};

// Test fixtures
fn create_test_limiter(config: &EndpointConfig) -> RateLimiter {
    RateLimiter::new(
        "test",
        config,
        PacingConfig::default(),
        BreakerConfig::default(),
    )
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_hourly_quota_resets_after_the_hour() {
    let limiter = create_test_limiter(
        &EndpointConfig::new("http://quota", 100.0, [1.0, 100.0]).with_limits(
            3,
            UNLIMITED,
            UNLIMITED,
        ),
    );

    assert!(limiter.try_acquire().await);
    assert!(limiter.try_acquire().await);
    assert!(limiter.try_acquire().await);

    let before = Instant::now();
    assert!(!limiter.try_acquire().await);
    // refusal is immediate, not a wait
    assert_eq!(Instant::now(), before);
    assert!(matches!(
        limiter.acquire().await,
        Admission::QuotaExhausted {
            window: WindowKind::Hour,
            ..
        }
    ));

    advance(Duration::from_secs(3_601)).await;
    assert!(limiter.try_acquire().await);
    assert_eq!(limiter.quota_snapshot().hour.count, 1);
    // the day window keeps counting across the hour boundary
    assert_eq!(limiter.quota_snapshot().day.count, 4);
}

#[tokio::test(start_paused = true)]
async fn test_grants_are_spaced_by_the_current_rate() {
    let limiter = create_test_limiter(&EndpointConfig::new("http://pace", 2.0, [1.0, 4.0]));

    let mut granted = Vec::new();
    for _ in 0..5 {
        assert!(limiter.try_acquire().await);
        granted.push(Instant::now());
    }

    for pair in granted.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(500));
    }
}

#[tokio::test(start_paused = true)]
async fn test_throttling_slows_pacing() {
    let limiter = create_test_limiter(&EndpointConfig::new("http://slow", 2.0, [1.0, 4.0]));
    assert!(limiter.try_acquire().await);

    limiter.on_throttled();
    assert!((limiter.current_rate() - 1.6).abs() < 1e-9);
    // a success resets the breaker streak before it opens
    limiter.on_success();
    assert_eq!(limiter.consecutive_failures(), 0);

    let start = Instant::now();
    assert!(limiter.try_acquire().await);
    let rate = limiter.current_rate();
    assert!(Instant::now() - start <= Duration::from_secs_f64(1.0 / rate));
}

#[tokio::test(start_paused = true)]
async fn test_breaker_suspends_then_reactivates() {
    let limiter = create_test_limiter(&EndpointConfig::new("http://flaky", 10.0, [1.0, 10.0]));
    assert!(limiter.try_acquire().await);

    assert_eq!(limiter.on_failure(), None);
    assert_eq!(limiter.on_failure(), Some(Duration::from_secs(240)));
    assert!(limiter.is_suspended());
    assert!(!limiter.try_acquire().await);

    advance(Duration::from_secs(239)).await;
    assert!(!limiter.try_acquire().await);

    advance(Duration::from_secs(1)).await;
    assert!(limiter.try_acquire().await);
    assert_eq!(limiter.consecutive_failures(), 0);
    assert!(!limiter.is_suspended());
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_extend_suspension_up_to_cap() {
    let limiter = create_test_limiter(&EndpointConfig::new("http://down", 10.0, [1.0, 10.0]));

    let durations: Vec<_> = (0..6).filter_map(|_| limiter.on_failure()).collect();
    assert_eq!(
        durations,
        vec![
            Duration::from_secs(240),
            Duration::from_secs(480),
            Duration::from_secs(600),
            Duration::from_secs(600),
            Duration::from_secs(600),
        ]
    );
    assert_eq!(limiter.next_available(), Some(Duration::from_secs(600)));
}

#[tokio::test(start_paused = true)]
async fn test_restored_quota_counts_towards_limit() {
    let config = EndpointConfig::new("http://restore", 100.0, [1.0, 100.0]).with_limits(
        2,
        UNLIMITED,
        UNLIMITED,
    );
    let first = create_test_limiter(&config);
    assert!(first.try_acquire().await);
    assert!(first.try_acquire().await);
    let snapshot = first.quota_snapshot();

    let second = create_test_limiter(&config);
    second.restore_quota(&snapshot);
    assert!(!second.try_acquire().await);
    assert!(second.next_available().is_some());
}

#[tokio::test(start_paused = true)]
async fn test_pacing_wait_parks_the_task() {
    let limiter = create_test_limiter(&EndpointConfig::new("http://park", 1.0, [0.5, 2.0]));
    assert!(limiter.try_acquire().await);

    let mut next = tokio_test::task::spawn(limiter.try_acquire());
    tokio_test::assert_pending!(next.poll());

    advance(Duration::from_secs(1)).await;
    assert!(next.is_woken());
    tokio_test::assert_ready_eq!(next.poll(), true);
}

async fn contend(limiter: &Arc<RateLimiter>, callers: usize) -> Vec<Instant> {
    let mut tasks = JoinSet::new();
    for _ in 0..callers {
        let limiter = limiter.clone();
        tasks.spawn(async move { limiter.try_acquire().await.then(Instant::now) });
    }
    let mut granted = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        granted.extend(joined.expect("caller task panicked"));
    }
    granted.sort();
    granted
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_callers_share_pacing_and_quota() {
    let limiter = Arc::new(create_test_limiter(
        &EndpointConfig::new("http://shared", 20.0, [1.0, 20.0]).with_limits(5, UNLIMITED, UNLIMITED),
    ));

    let granted = contend(&limiter, 20).await;

    assert_eq!(granted.len(), 5);
    assert_eq!(limiter.quota_snapshot().hour.count, 5);
    let interval = Duration::from_secs_f64(1.0 / limiter.current_rate());
    for pair in granted.windows(2) {
        assert!(pair[1] - pair[0] >= interval);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_callers_across_threads_respect_quota() {
    let limiter = Arc::new(create_test_limiter(
        &EndpointConfig::new("http://threads", 20.0, [1.0, 20.0]).with_limits(5, UNLIMITED, UNLIMITED),
    ));

    let start = Instant::now();
    let granted = contend(&limiter, 20).await;

    assert_eq!(granted.len(), 5);
    assert_eq!(limiter.quota_snapshot().hour.count, 5);
    // five grants need at least four full intervals between the first and the last
    assert!(Instant::now() - start >= Duration::from_millis(200));
}
