//! Rolling call statistics: windowed counters and latency percentiles.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;

const BUCKETS_PER_WINDOW: u32 = 16;
const MAX_LATENCY_SAMPLES: usize = 1024;

/// Classification of one finished (or rejected) call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// The call completed successfully.
    Success,

    /// The attempt loop gave up.
    Failure,

    /// The breaker rejected the call without running it.
    ShortCircuited,

    /// The call hit its deadline.
    Timeout,
}

const OUTCOMES: usize = 4;

fn outcome_index(outcome: CallOutcome) -> usize {
    match outcome {
        CallOutcome::Success => 0,
        CallOutcome::Failure => 1,
        CallOutcome::ShortCircuited => 2,
        CallOutcome::Timeout => 3,
    }
}

struct Bucket {
    started_at: Instant,
    counts: [u64; OUTCOMES],
}

struct MetricsInner {
    window: Duration,
    bucket_span: Duration,
    buckets: Mutex<SmallVec<[Bucket; 16]>>,
    latencies: Mutex<SmallVec<[(Instant, Duration); 32]>>,
}

/// Concurrency-safe rolling statistics for one protected call.
///
/// Writers append to time buckets and a bounded latency buffer under short
/// instance-scoped locks; samples that have aged out of the window are
/// discarded lazily when a snapshot is taken. Snapshots are approximate
/// under concurrent writes, never serialized against them.
///
/// Handles are cheap to clone; clones share the same window.
#[derive(Clone)]
pub struct CallMetrics {
    inner: Arc<MetricsInner>,
}

impl CallMetrics {
    /// Creates a collector with the given rolling window.
    ///
    /// # Panics
    ///
    /// Panics if `window` is zero.
    pub fn new(window: Duration) -> Self {
        assert!(!window.is_zero(), "metrics window must be non-zero");

        Self {
            inner: Arc::new(MetricsInner {
                window,
                bucket_span: window / BUCKETS_PER_WINDOW,
                buckets: Mutex::new(SmallVec::new()),
                latencies: Mutex::new(SmallVec::new()),
            }),
        }
    }

    /// The configured rolling window.
    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Records one call. `latency` is absent for calls the breaker rejected
    /// before they ran; those contribute no latency sample.
    pub fn record(&self, outcome: CallOutcome, latency: Option<Duration>) {
        let now = Instant::now();

        {
            let mut buckets = self.inner.buckets.lock();
            let need_new = match buckets.last() {
                Some(bucket) => now.duration_since(bucket.started_at) >= self.inner.bucket_span,
                None => true,
            };
            if need_new {
                // Bound memory between snapshots; window filtering itself
                // happens at snapshot time.
                if buckets.len() >= 2 * BUCKETS_PER_WINDOW as usize {
                    buckets.remove(0);
                }
                buckets.push(Bucket {
                    started_at: now,
                    counts: [0; OUTCOMES],
                });
            }
            if let Some(bucket) = buckets.last_mut() {
                bucket.counts[outcome_index(outcome)] += 1;
            }
        }

        if let Some(latency) = latency {
            let mut latencies = self.inner.latencies.lock();
            if latencies.len() >= MAX_LATENCY_SAMPLES {
                latencies.remove(0);
            }
            latencies.push((now, latency));
        }
    }

    /// Point-in-time view over the rolling window. Concurrent records may
    /// or may not be included.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = Instant::now();
        let cutoff = now.checked_sub(self.inner.window);
        let in_window = |at: Instant| cutoff.map_or(true, |c| at >= c);

        let mut counts = [0u64; OUTCOMES];
        {
            let mut buckets = self.inner.buckets.lock();
            while buckets.first().map_or(false, |bucket| {
                !in_window(bucket.started_at + self.inner.bucket_span)
            }) {
                buckets.remove(0);
            }
            for bucket in buckets.iter() {
                for (total, count) in counts.iter_mut().zip(bucket.counts.iter()) {
                    *total += count;
                }
            }
        }

        let mut samples: Vec<Duration> = {
            let mut latencies = self.inner.latencies.lock();
            while latencies.first().map_or(false, |(at, _)| !in_window(*at)) {
                latencies.remove(0);
            }
            latencies.iter().map(|(_, latency)| *latency).collect()
        };
        samples.sort_unstable();

        let total: u64 = counts.iter().sum();
        let window_secs = self.inner.window.as_secs_f64();

        MetricsSnapshot {
            window_start: cutoff.unwrap_or(now),
            window_end: now,
            success: counts[0],
            failure: counts[1],
            short_circuited: counts[2],
            timeout: counts[3],
            request_rate: total as f64 / window_secs,
            error_rate: (counts[1] + counts[3]) as f64 / window_secs,
            latency_p50: percentile(&samples, 0.50),
            latency_p95: percentile(&samples, 0.95),
            latency_p99: percentile(&samples, 0.99),
        }
    }
}

fn percentile(sorted: &[Duration], quantile: f64) -> Option<Duration> {
    if sorted.is_empty() {
        return None;
    }

    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    Some(sorted[rank.clamp(1, sorted.len()) - 1])
}

/// Exported view of the rolling window, retrievable on demand.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    /// Start of the observed window.
    pub window_start: Instant,

    /// End of the observed window (the snapshot time).
    pub window_end: Instant,

    /// Calls that completed successfully.
    pub success: u64,

    /// Calls whose attempt loop gave up.
    pub failure: u64,

    /// Calls rejected by the open breaker.
    pub short_circuited: u64,

    /// Calls that hit their deadline.
    pub timeout: u64,

    /// Recorded calls per second over the window.
    pub request_rate: f64,

    /// Failed plus timed-out calls per second over the window.
    pub error_rate: f64,

    /// Median end-to-end latency, when the window holds samples.
    pub latency_p50: Option<Duration>,

    /// 95th percentile end-to-end latency.
    pub latency_p95: Option<Duration>,

    /// 99th percentile end-to-end latency.
    pub latency_p99: Option<Duration>,
}
