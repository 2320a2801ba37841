//! Advanced walkthrough:
//!
//! 1. Registering an observer on the shared harness
//! 2. Resolving the protected call from a runtime registry
//! 3. Hammering a cached key from several threads
//! 4. Reading the metrics snapshot while calls are in flight

use callguard::{Executor, Harness, Registry};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct LookupError(String);

impl LookupError {
    fn new(msg: &str) -> Self {
        LookupError(msg.to_string())
    }
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lookup error: {}", self.0)
    }
}

impl Error for LookupError {}

type Provider = Arc<dyn Fn() -> Result<u64, LookupError> + Send + Sync>;

fn main() {
    // 1. Every failure on the call path lands here, including speculative
    // refresh failures the callers never see.
    let harness = Harness::new();
    harness.set_observer(|error| println!("  [tap] {}", error));

    // 2. Providers are registered at runtime and resolved per call. The
    // fallback stands in for tags nobody registered.
    let registry: Arc<Registry<Provider>> = Arc::new(Registry::new());
    let reads = Arc::new(AtomicU32::new(0));
    let source = Arc::clone(&reads);
    registry.register(
        "stock-level",
        Arc::new(move || {
            let n = source.fetch_add(1, Ordering::SeqCst);
            if n % 5 == 4 {
                Err(LookupError::new("transient read failure"))
            } else {
                Ok(40 + u64::from(n % 3))
            }
        }) as Provider,
    );
    registry.set_fallback(Arc::new(|| Err(LookupError::new("no such backend"))) as Provider);

    let executor = Arc::new(
        Executor::<String, u64, LookupError>::builder()
            .trip_threshold(5)
            .reset_timeout(Duration::from_secs(1))
            .cache_ttl(Duration::from_millis(200))
            .refresh_threshold(0.5)
            .max_attempts(2)
            .backoff_base(Duration::from_millis(10))
            .harness(harness)
            .build(),
    );

    // 3. Four workers share the executor; the cache keeps the backend to
    // one computation per expiry no matter how many readers pile up.
    let handles: Vec<_> = (0..4)
        .map(|worker| {
            let executor = Arc::clone(&executor);
            let registry = Arc::clone(&registry);
            thread::spawn(move || {
                for round in 0..10 {
                    let provider = registry.resolve("stock-level").unwrap();
                    match executor.call("stock-level".to_string(), || provider()) {
                        Ok(value) => {
                            println!("worker {} round {}: stock level {}", worker, round, value)
                        }
                        Err(err) => println!("worker {} round {}: {}", worker, round, err),
                    }
                    thread::sleep(Duration::from_millis(30));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // An unregistered tag resolves to the fallback provider, whose failure
    // flows through the same path and reaches the tap.
    let provider = registry.resolve("user-profile").unwrap();
    if let Err(err) = executor.call("user-profile".to_string(), || provider()) {
        println!("user-profile: {}", err);
    }

    // 4. The live counters: reads went to the backend far fewer times than
    // the workers called.
    let snapshot = executor.metrics().snapshot();
    println!(
        "\nbackend reads: {} | success={} failure={} short_circuited={} timeout={}",
        reads.load(Ordering::SeqCst),
        snapshot.success,
        snapshot.failure,
        snapshot.short_circuited,
        snapshot.timeout
    );
    println!(
        "latency p50={:?} p95={:?} p99={:?}",
        snapshot.latency_p50, snapshot.latency_p95, snapshot.latency_p99
    );
}
