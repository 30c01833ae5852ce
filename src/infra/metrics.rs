//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for every recording operation. `report()` swaps the periodic
//! counters to zero and returns a `MetricsSummary`; monotonic totals are only
//! loaded.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only; never use them for coordination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Call latency bucket boundaries (microseconds)
/// Buckets: ≤0.5ms, ≤1ms, ≤2.5ms, ≤5ms, ≤10ms, ≤25ms, ≤50ms, ≤100ms, ≤250ms, ≤500ms, >500ms
const BUCKET_BOUNDS: [u64; 10] =
    [500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = ((total as f64 * percentile) as u64).max(1);
    let mut cumulative = 0u64;

    // Last bucket reports twice the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [500, 1_000, 2_500, 5_000, 10_000, 25_000, 50_000, 100_000, 250_000, 500_000, 1_000_000];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Latency histogram with sum and max, reset on report
struct LatencyHistogram {
    buckets: [AtomicU64; NUM_BUCKETS],
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    #[inline]
    fn record(&self, latency_us: u64) {
        self.buckets[bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.max_us, latency_us);
    }

    fn take(&self) -> LatencySummary {
        let buckets = swap_buckets(&self.buckets);
        let sum = self.sum_us.swap(0, Ordering::Relaxed);
        let max_us = self.max_us.swap(0, Ordering::Relaxed);
        let count: u64 = buckets.iter().sum();
        LatencySummary {
            count,
            avg_us: if count > 0 { sum / count } else { 0 },
            max_us,
            p50_us: percentile_from_buckets(&buckets, 0.50),
            p99_us: percentile_from_buckets(&buckets, 0.99),
            buckets,
        }
    }
}

/// Lock-free metrics collector shared by every service
pub struct Metrics {
    /// Snapshots applied by the cache (monotonic)
    cache_updates_total: AtomicU64,
    /// Observer callbacks invoked (monotonic)
    observer_notifications_total: AtomicU64,
    /// Observer callbacks that panicked (monotonic)
    observer_panics_total: AtomicU64,
    /// Change-feed errors or disconnects (monotonic)
    stream_errors_total: AtomicU64,
    /// Change-feed reconnect attempts (monotonic)
    reconnects_total: AtomicU64,
    /// Stop-list transactions committed (monotonic)
    mutation_commits_total: AtomicU64,
    /// Version mismatches that triggered a retry (monotonic)
    conflict_retries_total: AtomicU64,
    /// Transactions that gave up after max attempts (monotonic)
    conflicts_total: AtomicU64,
    /// Mutations that failed for any other reason (monotonic)
    mutation_failures_total: AtomicU64,
    /// Import rows committed (monotonic)
    import_succeeded_total: AtomicU64,
    /// Import rows failed (monotonic)
    import_failed_total: AtomicU64,
    /// Import rows since last report (reset on report)
    import_rows_since_report: AtomicU64,
    /// Identity provisioning call latency
    identity_latency: LatencyHistogram,
    /// Stop-list transaction latency, retries included
    mutation_latency: LatencyHistogram,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cache_updates_total: AtomicU64::new(0),
            observer_notifications_total: AtomicU64::new(0),
            observer_panics_total: AtomicU64::new(0),
            stream_errors_total: AtomicU64::new(0),
            reconnects_total: AtomicU64::new(0),
            mutation_commits_total: AtomicU64::new(0),
            conflict_retries_total: AtomicU64::new(0),
            conflicts_total: AtomicU64::new(0),
            mutation_failures_total: AtomicU64::new(0),
            import_succeeded_total: AtomicU64::new(0),
            import_failed_total: AtomicU64::new(0),
            import_rows_since_report: AtomicU64::new(0),
            identity_latency: LatencyHistogram::new(),
            mutation_latency: LatencyHistogram::new(),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_cache_update(&self, observers_notified: u64) {
        self.cache_updates_total.fetch_add(1, Ordering::Relaxed);
        self.observer_notifications_total.fetch_add(observers_notified, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_observer_notified(&self) {
        self.observer_notifications_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_observer_panic(&self) {
        self.observer_panics_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_stream_error(&self) {
        self.stream_errors_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_reconnect(&self) {
        self.reconnects_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a committed stop-list transaction and its end-to-end latency
    #[inline]
    pub fn record_mutation_commit(&self, latency_us: u64) {
        self.mutation_commits_total.fetch_add(1, Ordering::Relaxed);
        self.mutation_latency.record(latency_us);
    }

    #[inline]
    pub fn record_conflict_retry(&self) {
        self.conflict_retries_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_conflict_exhausted(&self) {
        self.conflicts_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_mutation_failure(&self) {
        self.mutation_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_import_row(&self, committed: bool) {
        self.import_rows_since_report.fetch_add(1, Ordering::Relaxed);
        if committed {
            self.import_succeeded_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.import_failed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_identity_latency(&self, latency_us: u64) {
        self.identity_latency.record(latency_us);
    }

    #[inline]
    pub fn cache_updates_total(&self) -> u64 {
        self.cache_updates_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn stream_errors_total(&self) -> u64 {
        self.stream_errors_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn conflict_retries_total(&self) -> u64 {
        self.conflict_retries_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn mutation_commits_total(&self) -> u64 {
        self.mutation_commits_total.load(Ordering::Relaxed)
    }

    /// Calculate and return metrics summary, then reset periodic counters
    pub fn report(&self) -> MetricsSummary {
        let rows_count = self.import_rows_since_report.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };
        let import_rows_per_sec = if elapsed.as_secs_f64() > 0.0 {
            rows_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            cache_updates_total: self.cache_updates_total.load(Ordering::Relaxed),
            observer_notifications_total: self.observer_notifications_total.load(Ordering::Relaxed),
            observer_panics_total: self.observer_panics_total.load(Ordering::Relaxed),
            stream_errors_total: self.stream_errors_total.load(Ordering::Relaxed),
            reconnects_total: self.reconnects_total.load(Ordering::Relaxed),
            mutation_commits_total: self.mutation_commits_total.load(Ordering::Relaxed),
            conflict_retries_total: self.conflict_retries_total.load(Ordering::Relaxed),
            conflicts_total: self.conflicts_total.load(Ordering::Relaxed),
            mutation_failures_total: self.mutation_failures_total.load(Ordering::Relaxed),
            import_succeeded_total: self.import_succeeded_total.load(Ordering::Relaxed),
            import_failed_total: self.import_failed_total.load(Ordering::Relaxed),
            import_rows_per_sec,
            identity: self.identity_latency.take(),
            mutation: self.mutation_latency.take(),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

/// One latency histogram taken at report time
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencySummary {
    pub count: u64,
    pub avg_us: u64,
    pub max_us: u64,
    pub p50_us: u64,
    pub p99_us: u64,
    pub buckets: [u64; NUM_BUCKETS],
}

#[derive(Debug)]
pub struct MetricsSummary {
    pub cache_updates_total: u64,
    pub observer_notifications_total: u64,
    pub observer_panics_total: u64,
    pub stream_errors_total: u64,
    pub reconnects_total: u64,
    pub mutation_commits_total: u64,
    pub conflict_retries_total: u64,
    pub conflicts_total: u64,
    pub mutation_failures_total: u64,
    pub import_succeeded_total: u64,
    pub import_failed_total: u64,
    pub import_rows_per_sec: f64,
    /// Identity provisioning latency since last report
    pub identity: LatencySummary,
    /// Stop-list transaction latency since last report
    pub mutation: LatencySummary,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            cache_updates = %self.cache_updates_total,
            notifications = %self.observer_notifications_total,
            stream_errors = %self.stream_errors_total,
            reconnects = %self.reconnects_total,
            commits = %self.mutation_commits_total,
            conflict_retries = %self.conflict_retries_total,
            conflicts = %self.conflicts_total,
            imported = %self.import_succeeded_total,
            import_failed = %self.import_failed_total,
            rows_per_sec = format!("{:.1}", self.import_rows_per_sec),
            identity_p50_us = %self.identity.p50_us,
            identity_p99_us = %self.identity.p99_us,
            mutation_p99_us = %self.mutation.p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_new() {
        let metrics = Metrics::new();
        assert_eq!(metrics.cache_updates_total(), 0);
        assert_eq!(metrics.mutation_commits_total(), 0);
    }

    #[test]
    fn test_record_cache_update() {
        let metrics = Metrics::new();
        metrics.record_cache_update(3);
        metrics.record_cache_update(0);
        metrics.record_observer_notified();

        let summary = metrics.report();
        assert_eq!(summary.cache_updates_total, 2);
        assert_eq!(summary.observer_notifications_total, 4);
    }

    #[test]
    fn test_report_resets_latency_but_not_totals() {
        let metrics = Metrics::new();
        metrics.record_mutation_commit(1_000);
        metrics.record_mutation_commit(3_000);
        metrics.record_conflict_retry();
        metrics.record_import_row(true);
        metrics.record_import_row(false);

        let summary = metrics.report();
        assert_eq!(summary.mutation_commits_total, 2);
        assert_eq!(summary.mutation.count, 2);
        assert_eq!(summary.mutation.avg_us, 2_000);
        assert_eq!(summary.mutation.max_us, 3_000);
        assert_eq!(summary.conflict_retries_total, 1);
        assert_eq!(summary.import_succeeded_total, 1);
        assert_eq!(summary.import_failed_total, 1);

        let again = metrics.report();
        assert_eq!(again.mutation_commits_total, 2);
        assert_eq!(again.mutation.count, 0);
        assert_eq!(again.mutation.max_us, 0);
    }

    #[test]
    fn test_report_empty() {
        let summary = Metrics::new().report();
        assert_eq!(summary.identity.count, 0);
        assert_eq!(summary.identity.p99_us, 0);
        assert_eq!(summary.import_rows_per_sec as u64, 0);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let m = metrics.clone();
            handles.push(thread::spawn(move || {
                for i in 0..1000 {
                    m.record_identity_latency(i as u64);
                    m.record_conflict_retry();
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(metrics.conflict_retries_total(), 10_000);
        assert_eq!(metrics.report().identity.count, 10_000);
    }

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(500), 0);
        assert_eq!(bucket_index(501), 1);
        assert_eq!(bucket_index(1_000), 1);
        assert_eq!(bucket_index(500_000), 9);
        assert_eq!(bucket_index(500_001), 10);
    }

    #[test]
    fn test_percentile_computation() {
        let metrics = Metrics::new();
        for _ in 0..99 {
            metrics.record_identity_latency(800);
        }
        metrics.record_identity_latency(400_000);

        let summary = metrics.report();
        assert_eq!(summary.identity.p50_us, 1_000);
        assert_eq!(summary.identity.p99_us, 1_000);
        assert_eq!(summary.identity.buckets[9], 1);
    }
}
