use byte_throttle::{
    DelayKind, ManualClock, Throttle, ThrottleBuilder, ThrottleError, ThrottleState,
};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_burst_then_delay_scenario() {
    init_tracing();
    let throttle = Throttle::builder()
        .rate(1_000_000)
        .burst(2_000_000)
        .build()
        .unwrap();
    let state = throttle.new_state();
    let cancel = CancellationToken::new();
    assert_eq!(state.available_tokens(), 2_000_000);

    let start = Instant::now();
    throttle
        .account_or_wait(&state, 1_500_000, &cancel)
        .await
        .unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));

    // 500_000 short at 1_000_000 B/s: about half a second.
    let start = Instant::now();
    throttle
        .account_or_wait(&state, 1_000_000, &cancel)
        .await
        .unwrap();
    let waited = start.elapsed();
    println!("second request waited {waited:?}");
    assert!(waited >= Duration::from_millis(400));
    assert!(waited < Duration::from_millis(1500));
}

#[tokio::test]
async fn test_rate_zero_admits_any_size() {
    let throttle = Throttle::builder().build().unwrap();
    let state = ThrottleState::new(5, 42);
    let cancel = CancellationToken::new();

    for amount in [1, 1 << 20, i64::MAX] {
        let start = Instant::now();
        throttle.account_or_wait(&state, amount, &cancel).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(50));
    }
    assert_eq!(state.available_tokens(), 5);
    assert_eq!(state.last_refill_tick(), 42);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_streams_stay_within_budget() {
    init_tracing();
    const CAPACITY: i64 = 100_000;
    const RATE: i64 = 200_000;
    const CHUNK: i64 = 10_000;
    const STREAMS: usize = 8;

    let throttle = Arc::new(Throttle::builder().rate(RATE).burst(CAPACITY).build().unwrap());
    let state = Arc::new(throttle.new_state());
    let admitted = Arc::new(AtomicI64::new(0));
    let start = Instant::now();

    let mut handles = vec![];
    for _ in 0..STREAMS {
        let throttle = Arc::clone(&throttle);
        let state = Arc::clone(&state);
        let admitted = Arc::clone(&admitted);
        handles.push(tokio::spawn(async move {
            let cancel = CancellationToken::new();
            while start.elapsed() < Duration::from_millis(800) {
                throttle.account_or_wait(&state, CHUNK, &cancel).await.unwrap();
                admitted.fetch_add(CHUNK, Ordering::SeqCst);
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let elapsed = start.elapsed().as_secs_f64();
    let total = admitted.load(Ordering::SeqCst);
    let bound = CAPACITY as f64 + RATE as f64 * elapsed + CHUNK as f64;
    println!("admitted {total} bytes in {elapsed:.3}s (bound {bound:.0})");

    assert!((total as f64) <= bound);
    // Everyone made progress past the initial burst.
    assert!(total > CAPACITY);

    let available = state.available_tokens();
    assert!((0..=CAPACITY).contains(&available));
}

#[test]
fn test_shared_state_never_overspends() {
    // A frozen clock means no refills: exactly the burst can be admitted, no
    // matter how the threads interleave.
    let clock = Arc::new(ManualClock::new());
    let throttle = Arc::new(
        ThrottleBuilder::new()
            .rate(1_000)
            .burst(10_000)
            .clock(Arc::clone(&clock))
            .build()
            .unwrap(),
    );
    let state = Arc::new(throttle.new_state());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let throttle = Arc::clone(&throttle);
            let state = Arc::clone(&state);
            thread::spawn(move || {
                let mut admitted = 0i64;
                for _ in 0..5_000 {
                    while !throttle.try_account(&state, 1) {
                        if state.available_tokens() == 0 {
                            return admitted;
                        }
                    }
                    admitted += 1;
                }
                admitted
            })
        })
        .collect();

    let total: i64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(total, 10_000);
    assert_eq!(state.available_tokens(), 0);
    assert_eq!(throttle.metrics().admitted_bytes, 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_convergence() {
    const RATE: i64 = 100_000;
    let throttle = Throttle::builder().rate(RATE).burst(5_000).build().unwrap();
    let state = throttle.new_state();
    let cancel = CancellationToken::new();

    // Spend the banked burst so only the rate is left.
    throttle.account_or_wait(&state, 5_000, &cancel).await.unwrap();

    let start = Instant::now();
    let mut sent = 0;
    while sent < RATE {
        throttle.account_or_wait(&state, 2_500, &cancel).await.unwrap();
        sent += 2_500;
    }
    let elapsed = start.elapsed();
    let observed = sent as f64 / elapsed.as_secs_f64();
    println!("observed {observed:.0} B/s against {RATE} B/s");

    assert!(elapsed >= Duration::from_millis(900), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(1800), "{elapsed:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_one_token_cancels_every_waiter() {
    let throttle = Arc::new(Throttle::builder().rate(100).build().unwrap());
    let cancel = CancellationToken::new();

    let mut handles = vec![];
    for _ in 0..4 {
        let throttle = Arc::clone(&throttle);
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
            // An empty state: each waiter needs ten seconds of refill.
            let state = ThrottleState::new(0, byte_throttle::monotonic_nanos());
            throttle.account_or_wait(&state, 1_000, &cancel).await
        }));
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let start = Instant::now();
    cancel.cancel();

    for handle in handles {
        let outcome = handle.await.unwrap();
        assert!(matches!(outcome, Err(ThrottleError::Cancelled)));
    }
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(throttle.metrics().cancellations, 4);
}

#[tokio::test]
async fn test_independent_states_have_independent_budgets() {
    let throttle = Throttle::builder().rate(1_000).burst(1_000).build().unwrap();
    let a = throttle.new_state();
    let b = throttle.new_state();
    let cancel = CancellationToken::new();

    throttle.account_or_wait(&a, 1_000, &cancel).await.unwrap();
    let start = Instant::now();
    throttle.account_or_wait(&b, 1_000, &cancel).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(100));
    assert!(!throttle.try_account(&a, 500));
}

#[tokio::test]
async fn test_portable_and_high_resolution_agree() {
    for kind in [DelayKind::Portable, DelayKind::HighResolution] {
        let throttle = Throttle::builder()
            .rate(10_000)
            .delay_kind(kind)
            .build()
            .unwrap();
        let state = throttle.new_state();
        let cancel = CancellationToken::new();

        throttle.account_or_wait(&state, 10_000, &cancel).await.unwrap();
        let start = Instant::now();
        throttle.account_or_wait(&state, 1_000, &cancel).await.unwrap();
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(80), "{kind:?}: {waited:?}");
        assert!(waited < Duration::from_millis(1000), "{kind:?}: {waited:?}");
    }
}

#[tokio::test]
async fn test_shared_engine_free_functions() {
    // The only test in this binary touching the process-wide engine.
    byte_throttle::configure(0, None).unwrap();
    let state = ThrottleState::zeroed();
    byte_throttle::account_or_wait(&state, 1 << 30, &CancellationToken::new())
        .await
        .unwrap();

    assert!(byte_throttle::configure(-10, None).is_err());
    assert!(byte_throttle::read_config().is_disabled());
}
