use callguard::{CallError, Executor};
use std::error::Error;
use std::fmt;
use std::thread;
use std::time::Duration;

#[derive(Debug)]
struct ServiceError(String);

impl ServiceError {
    fn new(msg: &str) -> Self {
        ServiceError(msg.to_string())
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "service error: {}", self.0)
    }
}

impl Error for ServiceError {}

// Simulates an external service that goes down for a stretch of calls and
// then recovers.
fn call_service(count: &mut u32) -> Result<String, ServiceError> {
    *count += 1;
    if (4..=9).contains(count) {
        Err(ServiceError::new("connection refused"))
    } else {
        Ok(format!("response #{}", count))
    }
}

fn main() {
    let executor = Executor::<&str, String, ServiceError>::builder()
        .trip_threshold(3)
        .reset_timeout(Duration::from_secs(2))
        .max_attempts(2)
        .backoff_base(Duration::from_millis(50))
        .build();

    println!("breaker starts {:?}", executor.breaker().state());

    let mut count = 0;
    for i in 1..=12 {
        match executor.call("inventory", || call_service(&mut count)) {
            Ok(response) => println!("call {}: {}", i, response),
            Err(CallError::ShortCircuited) => {
                println!("call {}: breaker open, backing off", i);
                thread::sleep(Duration::from_millis(500));
            }
            Err(err) => println!("call {}: {}", i, err),
        }

        println!(
            "  state={:?} consecutive_failures={}",
            executor.breaker().state(),
            executor.breaker().consecutive_failures()
        );
    }

    let snapshot = executor.metrics().snapshot();
    println!(
        "\ntotals: success={} failure={} short_circuited={}",
        snapshot.success, snapshot.failure, snapshot.short_circuited
    );
}
