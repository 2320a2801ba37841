use callguard::{
    CacheError, CallError, CallMetrics, CallOutcome, CircuitBreaker, Executor, Harness, Outcome,
    Registry, RetryPolicy, SingleFlightCache, State,
};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

// Custom error type that implements Error trait
#[derive(Debug)]
struct TestError(String);

impl TestError {
    fn new(msg: &str) -> Self {
        TestError(msg.to_string())
    }
}

impl fmt::Display for TestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "test error: {}", self.0)
    }
}

impl Error for TestError {}

#[test]
fn test_breaker_trips_after_threshold() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
    assert_eq!(breaker.state(), State::Closed);

    breaker.record_failure();
    breaker.record_failure();
    assert!(breaker.allow());
    assert_eq!(breaker.state(), State::Closed);

    breaker.record_failure();
    assert_eq!(breaker.state(), State::Open);
    assert!(!breaker.allow());
}

#[test]
fn test_breaker_success_resets_counter() {
    let breaker = CircuitBreaker::new(3, Duration::from_secs(60));

    breaker.record_failure();
    breaker.record_failure();
    breaker.record_success();
    assert_eq!(breaker.consecutive_failures(), 0);

    // The old failures no longer count towards the threshold.
    breaker.record_failure();
    breaker.record_failure();
    assert_eq!(breaker.state(), State::Closed);

    breaker.record_failure();
    assert_eq!(breaker.state(), State::Open);
}

#[test]
fn test_breaker_admits_single_trial_among_concurrent_callers() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(50));

    breaker.record_failure();
    assert_eq!(breaker.state(), State::Open);
    assert!(!breaker.allow());

    thread::sleep(Duration::from_millis(100));

    const CALLERS: usize = 16;
    let admitted = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let breaker = breaker.clone();
            let admitted = Arc::clone(&admitted);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                if breaker.allow() {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(admitted.load(Ordering::SeqCst), 1);
    assert_eq!(breaker.state(), State::HalfOpen);

    // Further callers stay locked out until the trial's outcome lands.
    assert!(!breaker.allow());

    breaker.record_success();
    assert_eq!(breaker.state(), State::Closed);
    assert!(breaker.allow());
}

#[test]
fn test_breaker_failed_trial_reopens_with_fresh_timeout() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(50));

    breaker.record_failure();
    assert_eq!(breaker.state(), State::Open);

    thread::sleep(Duration::from_millis(100));
    assert!(breaker.allow());
    assert_eq!(breaker.state(), State::HalfOpen);

    breaker.record_failure();
    assert_eq!(breaker.state(), State::Open);
    assert!(!breaker.allow());
}

#[test]
fn test_breaker_aborted_trial_reopens_without_counting_failure() {
    let breaker = CircuitBreaker::new(1, Duration::from_millis(50));

    breaker.record_failure();
    thread::sleep(Duration::from_millis(100));
    assert!(breaker.allow());
    assert_eq!(breaker.state(), State::HalfOpen);

    breaker.abort_trial();
    assert_eq!(breaker.state(), State::Open);

    // A fresh timeout applies before the next trial is admitted.
    assert!(!breaker.allow());
    thread::sleep(Duration::from_millis(100));
    assert!(breaker.allow());
    assert_eq!(breaker.state(), State::HalfOpen);
}

#[test]
fn test_retry_exhaustion_records_every_attempt() {
    let policy = RetryPolicy::new(3, Duration::from_millis(1), 2.0, 0.0);
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = policy.run(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(TestError::new("boom"))
    });

    let failure = result.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(failure.outcome(), Outcome::Exhausted);
    assert_eq!(failure.attempts().len(), 3);
    for (index, attempt) in failure.attempts().iter().enumerate() {
        assert_eq!(attempt.attempt as usize, index + 1);
    }
}

#[test]
fn test_retry_single_attempt_fails_without_retrying() {
    let policy = RetryPolicy::new(1, Duration::from_millis(1), 2.0, 0.0);
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = policy.run(|| {
        calls.fetch_add(1, Ordering::SeqCst);
        Err(TestError::new("boom"))
    });

    let failure = result.unwrap_err();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(failure.attempts().len(), 1);
    assert_eq!(failure.outcome(), Outcome::Exhausted);
}

#[test]
fn test_retry_returns_first_success() {
    let policy = RetryPolicy::new(5, Duration::from_millis(1), 1.0, 0.0);
    let calls = AtomicU32::new(0);

    let result = policy.run(|| {
        let call = calls.fetch_add(1, Ordering::SeqCst);
        if call < 2 {
            Err(TestError::new("warming up"))
        } else {
            Ok(call)
        }
    });

    assert_eq!(result.unwrap(), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_retry_deadline_aborts_mid_loop() {
    let policy = RetryPolicy::new(10, Duration::from_millis(50), 1.0, 0.0);
    let deadline = Instant::now() + Duration::from_millis(70);

    let result: Result<(), _> = policy.run_until(Some(deadline), || Err(TestError::new("down")));

    let failure = result.unwrap_err();
    assert_eq!(failure.outcome(), Outcome::TimedOut);
    assert!(!failure.attempts().is_empty());
    assert!(failure.attempts().len() < 10);
}

#[test]
fn test_cache_single_flight_on_expiry() {
    let cache = Arc::new(SingleFlightCache::<&str, u64, TestError>::new(0.5));
    let ttl = Duration::from_millis(10);

    cache.get_or_compute("level", ttl, || Ok(1)).unwrap();
    thread::sleep(Duration::from_millis(30));

    const READERS: usize = 100;
    let computes = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(READERS));

    let handles: Vec<_> = (0..READERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache
                    .get_or_compute("level", Duration::from_secs(60), || {
                        computes.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(2u64)
                    })
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 2);
    }

    assert_eq!(computes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_cache_recompute_failure_reaches_every_waiter() {
    let cache = Arc::new(SingleFlightCache::<&str, u64, TestError>::new(0.5));

    const READERS: usize = 5;
    let computes = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(READERS));

    let handles: Vec<_> = (0..READERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let computes = Arc::clone(&computes);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get_or_compute("level", Duration::from_secs(60), || {
                    computes.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    Err(TestError::new("backend down"))
                })
            })
        })
        .collect();

    let mut led = 0;
    let mut attached = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Err(CacheError::Compute(_)) => led += 1,
            Err(CacheError::Shared(_)) => attached += 1,
            other => panic!("expected a propagated failure, got {:?}", other.is_ok()),
        }
    }

    assert_eq!(computes.load(Ordering::SeqCst), 1);
    assert_eq!(led, 1);
    assert_eq!(attached, READERS - 1);
    assert!(cache.is_empty());
}

#[test]
fn test_cache_panicking_compute_wakes_waiters() {
    let cache = Arc::new(SingleFlightCache::<&str, u64, TestError>::new(0.5));

    const READERS: usize = 4;
    let barrier = Arc::new(Barrier::new(READERS));

    let handles: Vec<_> = (0..READERS)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get_or_compute("level", Duration::from_secs(60), || {
                    thread::sleep(Duration::from_millis(100));
                    panic!("compute exploded")
                })
            })
        })
        .collect();

    let mut panicked = 0;
    let mut poisoned = 0;
    for handle in handles {
        match handle.join() {
            Err(_) => panicked += 1,
            Ok(Err(CacheError::Poisoned)) => poisoned += 1,
            Ok(other) => panic!("expected a poisoned waiter, got ok={}", other.is_ok()),
        }
    }

    // The panic resumes in the leader; every waiter is woken, not stranded.
    assert_eq!(panicked, 1);
    assert_eq!(poisoned, READERS - 1);
    assert!(cache.is_empty());
}

#[test]
fn test_cache_speculative_refresh_returns_stale_value() {
    let cache = SingleFlightCache::<&str, u64, TestError>::new(0.5);
    let ttl = Duration::from_millis(80);
    let computes = AtomicUsize::new(0);

    cache.get_or_compute("level", ttl, || Ok(1)).unwrap();
    thread::sleep(Duration::from_millis(50));

    // Past half of the time-to-live every lookup may draw an early refresh.
    // The drawing caller must still be served the value it found.
    loop {
        let before = computes.load(Ordering::SeqCst);
        let value = cache
            .get_or_compute("level", ttl, || {
                computes.fetch_add(1, Ordering::SeqCst);
                Ok(2)
            })
            .unwrap();
        if computes.load(Ordering::SeqCst) > before && value != 2 {
            assert_eq!(value, 1);
        }
        if value == 2 {
            break;
        }
    }

    assert!(computes.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_cache_speculative_refresh_failure_is_swallowed() {
    let observed = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&observed);
    let cache = SingleFlightCache::<&str, u64, TestError>::new(0.5)
        .on_refresh_error(move |_| {
            sink.fetch_add(1, Ordering::SeqCst);
        });
    let ttl = Duration::from_millis(80);

    cache.get_or_compute("level", ttl, || Ok(1)).unwrap();
    thread::sleep(Duration::from_millis(50));

    // Refresh failures must never surface while the value is still fresh;
    // once it expires the mandatory recompute failure does.
    let mandatory = loop {
        match cache.get_or_compute("level", ttl, || Err(TestError::new("flaky"))) {
            Ok(value) => assert_eq!(value, 1),
            Err(error) => break error,
        }
    };

    assert!(matches!(mandatory, CacheError::Compute(_)));
    assert!(observed.load(Ordering::SeqCst) >= 1);
}

#[test]
fn test_cache_invalidate_forces_recompute() {
    let cache = SingleFlightCache::<&str, u64, TestError>::new(0.5);
    let computes = AtomicUsize::new(0);
    let compute = || {
        computes.fetch_add(1, Ordering::SeqCst);
        Ok(7)
    };

    cache
        .get_or_compute("level", Duration::from_secs(60), compute)
        .unwrap();
    cache
        .get_or_compute("level", Duration::from_secs(60), compute)
        .unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 1);
    assert_eq!(cache.len(), 1);

    cache.invalidate(&"level");
    assert!(cache.is_empty());

    cache
        .get_or_compute("level", Duration::from_secs(60), compute)
        .unwrap();
    assert_eq!(computes.load(Ordering::SeqCst), 2);
}

#[test]
fn test_executor_short_circuits_after_threshold() {
    let executor = Executor::<&str, u64, TestError>::builder()
        .trip_threshold(3)
        .reset_timeout(Duration::from_secs(60))
        .max_attempts(1)
        .build();
    let invocations = AtomicU32::new(0);

    for _ in 0..3 {
        let result = executor.call("svc", || {
            invocations.fetch_add(1, Ordering::SeqCst);
            Err(TestError::new("down"))
        });
        assert!(matches!(result, Err(CallError::Attempts(_))));
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 3);
    assert_eq!(executor.breaker().state(), State::Open);

    // The fourth call never reaches the user function.
    let result = executor.call("svc", || {
        invocations.fetch_add(1, Ordering::SeqCst);
        Err(TestError::new("down"))
    });
    assert!(matches!(result, Err(CallError::ShortCircuited)));
    assert_eq!(invocations.load(Ordering::SeqCst), 3);

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.failure, 3);
    assert_eq!(snapshot.short_circuited, 1);
}

#[test]
fn test_executor_fallback_substitutes_and_still_records() {
    let observed = Arc::new(AtomicUsize::new(0));
    let executor = Executor::<&str, u64, TestError>::builder()
        .trip_threshold(1)
        .reset_timeout(Duration::from_secs(60))
        .max_attempts(1)
        .fallback(|| 99)
        .build();
    let sink = Arc::clone(&observed);
    executor.harness().set_observer(move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    // The failure is substituted but trips the breaker anyway.
    let result = executor.call("svc", || Err(TestError::new("down")));
    assert_eq!(result.unwrap(), 99);
    assert_eq!(executor.breaker().state(), State::Open);

    // Short-circuited calls fall back too.
    let result = executor.call("svc", || Ok(1));
    assert_eq!(result.unwrap(), 99);

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.failure, 1);
    assert_eq!(snapshot.short_circuited, 1);
    assert_eq!(observed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_executor_deadline_yields_timeout_outcome() {
    let executor = Executor::<&str, u64, TestError>::builder()
        .max_attempts(5)
        .backoff_base(Duration::from_millis(50))
        .backoff_multiplier(1.0)
        .jitter_fraction(0.0)
        .call_timeout(Duration::from_millis(70))
        .build();

    let result = executor.call("svc", || Err(TestError::new("down")));
    match result {
        Err(CallError::Attempts(failure)) => {
            assert_eq!(failure.outcome(), Outcome::TimedOut);
            assert!(!failure.attempts().is_empty());
        }
        other => panic!("expected a timed out failure, got ok={}", other.is_ok()),
    }

    let snapshot = executor.metrics().snapshot();
    assert_eq!(snapshot.timeout, 1);
    // The attempts that ran count against the breaker.
    assert!(executor.breaker().consecutive_failures() >= 1);
}

#[test]
fn test_executor_cancelled_caller_leaves_breaker_untouched() {
    let executor = Executor::<&str, u64, TestError>::builder()
        .max_attempts(3)
        .call_timeout(Duration::ZERO)
        .build();

    let result = executor.call("svc", || Ok(1));
    match result {
        Err(CallError::Attempts(failure)) => {
            assert_eq!(failure.outcome(), Outcome::TimedOut);
            assert!(failure.attempts().is_empty());
        }
        other => panic!("expected a timed out failure, got ok={}", other.is_ok()),
    }

    assert_eq!(executor.breaker().consecutive_failures(), 0);
    assert_eq!(executor.metrics().snapshot().timeout, 1);
}

#[test]
fn test_executor_releases_trial_abandoned_before_any_attempt() {
    let executor = Executor::<&str, u64, TestError>::builder()
        .trip_threshold(1)
        .reset_timeout(Duration::from_millis(50))
        .max_attempts(3)
        .call_timeout(Duration::ZERO)
        .build();

    executor.breaker().record_failure();
    assert_eq!(executor.breaker().state(), State::Open);
    thread::sleep(Duration::from_millis(100));

    // This caller claims the half-open trial, then its deadline expires
    // before the first attempt runs. The claim must not stay held.
    let result = executor.call("svc", || Ok(1));
    match result {
        Err(CallError::Attempts(failure)) => {
            assert_eq!(failure.outcome(), Outcome::TimedOut);
            assert!(failure.attempts().is_empty());
        }
        other => panic!("expected a timed out failure, got ok={}", other.is_ok()),
    }
    assert_eq!(executor.breaker().state(), State::Open);

    // After a fresh timeout the next trial is admitted as usual.
    thread::sleep(Duration::from_millis(100));
    assert!(executor.breaker().allow());
    executor.breaker().record_success();
    assert_eq!(executor.breaker().state(), State::Closed);
}

#[test]
fn test_executor_single_flight_under_concurrency() {
    let executor = Arc::new(
        Executor::<&str, u64, TestError>::builder()
            .cache_ttl(Duration::from_secs(60))
            .max_attempts(1)
            .build(),
    );

    const CALLERS: usize = 20;
    let invocations = Arc::new(AtomicU32::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let executor = Arc::clone(&executor);
            let invocations = Arc::clone(&invocations);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                executor
                    .call("svc", || {
                        invocations.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        Ok(7)
                    })
                    .unwrap()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 7);
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(executor.metrics().snapshot().success, CALLERS as u64);
    assert_eq!(executor.breaker().state(), State::Closed);
}

#[test]
fn test_executor_shared_recompute_failure() {
    let executor = Arc::new(
        Executor::<&str, u64, TestError>::builder()
            .cache_ttl(Duration::from_secs(60))
            .max_attempts(1)
            .trip_threshold(100)
            .build(),
    );

    const CALLERS: usize = 5;
    let invocations = Arc::new(AtomicU32::new(0));
    let barrier = Arc::new(Barrier::new(CALLERS));

    let handles: Vec<_> = (0..CALLERS)
        .map(|_| {
            let executor = Arc::clone(&executor);
            let invocations = Arc::clone(&invocations);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                executor.call("svc", || {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(100));
                    Err(TestError::new("backend down"))
                })
            })
        })
        .collect();

    let mut drove = 0;
    let mut shared = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Err(CallError::Attempts(failure)) => {
                assert_eq!(failure.attempts().len(), 1);
                drove += 1;
            }
            Err(CallError::Recompute(failure)) => {
                assert_eq!(failure.outcome(), Outcome::Exhausted);
                shared += 1;
            }
            other => panic!("expected a failure, got ok={}", other.is_ok()),
        }
    }

    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(drove, 1);
    assert_eq!(shared, CALLERS - 1);
    assert_eq!(executor.metrics().snapshot().failure, CALLERS as u64);
}

#[test]
fn test_registry_resolution() {
    let registry = Registry::new();

    let error = registry.resolve("db").unwrap_err();
    assert_eq!(error.tag(), "db");

    registry.register("db", 42);
    assert!(registry.contains("db"));
    assert_eq!(registry.resolve("db").unwrap(), 42);

    assert_eq!(registry.deregister("db"), Some(42));
    assert!(!registry.contains("db"));
    assert!(registry.resolve("db").is_err());

    registry.set_fallback(7);
    assert_eq!(registry.resolve("db").unwrap(), 7);
}

#[test]
fn test_harness_observer_sees_reported_failures() {
    let harness = Harness::new();
    let observed = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&observed);
    harness.set_observer(move |_| {
        sink.fetch_add(1, Ordering::SeqCst);
    });

    harness.observe(&TestError::new("first"));
    harness.observe(&TestError::new("second"));
    assert_eq!(observed.load(Ordering::SeqCst), 2);
}

#[test]
fn test_metrics_window_excludes_old_samples() {
    let metrics = CallMetrics::new(Duration::from_millis(50));

    metrics.record(CallOutcome::Success, Some(Duration::from_millis(5)));
    thread::sleep(Duration::from_millis(80));

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.success, 0);
    assert_eq!(snapshot.latency_p50, None);

    metrics.record(CallOutcome::Success, Some(Duration::from_millis(5)));
    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.success, 1);
    assert_eq!(snapshot.latency_p50, Some(Duration::from_millis(5)));
}

#[test]
fn test_metrics_latency_percentiles() {
    let metrics = CallMetrics::new(Duration::from_secs(60));

    for ms in 1..=100u64 {
        metrics.record(CallOutcome::Success, Some(Duration::from_millis(ms)));
    }

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.success, 100);
    assert_eq!(snapshot.latency_p50, Some(Duration::from_millis(50)));
    assert_eq!(snapshot.latency_p95, Some(Duration::from_millis(95)));
    assert_eq!(snapshot.latency_p99, Some(Duration::from_millis(99)));
}

#[test]
fn test_metrics_snapshot_concurrent_with_writers() {
    let metrics = CallMetrics::new(Duration::from_secs(60));

    const WRITERS: usize = 4;
    const RECORDS: usize = 500;
    let barrier = Arc::new(Barrier::new(WRITERS + 1));

    let handles: Vec<_> = (0..WRITERS)
        .map(|_| {
            let metrics = metrics.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..RECORDS {
                    metrics.record(CallOutcome::Success, Some(Duration::from_millis(1)));
                }
            })
        })
        .collect();

    barrier.wait();
    for _ in 0..50 {
        let _ = metrics.snapshot();
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.success, (WRITERS * RECORDS) as u64);
}

#[test]
#[should_panic(expected = "trip_threshold")]
fn test_builder_rejects_zero_trip_threshold() {
    let _ = Executor::<&str, u64, TestError>::builder().trip_threshold(0);
}

#[test]
#[should_panic(expected = "max_attempts")]
fn test_builder_rejects_zero_max_attempts() {
    let _ = Executor::<&str, u64, TestError>::builder().max_attempts(0);
}

#[test]
#[should_panic(expected = "jitter_fraction")]
fn test_builder_rejects_out_of_range_jitter() {
    let _ = Executor::<&str, u64, TestError>::builder().jitter_fraction(1.5);
}

#[test]
#[should_panic(expected = "refresh_threshold")]
fn test_builder_rejects_out_of_range_refresh_threshold() {
    let _ = Executor::<&str, u64, TestError>::builder().refresh_threshold(1.0);
}
