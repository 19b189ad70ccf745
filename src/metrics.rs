// ABOUTME: Process-wide counter bag, initialised once and updated with atomic adds
// ABOUTME: Read by the periodic stats logger; counters only ever go up

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct Metrics {
    blocks_handled: AtomicU64,
    flush_count: AtomicU64,
    flushed_rows: AtomicU64,
    flush_duration_ns: AtomicU64,
    rows_written: AtomicU64,
    bundles_uploaded: AtomicU64,
}

impl Metrics {
    pub fn record_block(&self) {
        self.blocks_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, rows: u64, duration: Duration) {
        self.flush_count.fetch_add(1, Ordering::Relaxed);
        self.flushed_rows.fetch_add(rows, Ordering::Relaxed);
        self.flush_duration_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_rows_written(&self, rows: u64) {
        self.rows_written.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_bundle_uploaded(&self) {
        self.bundles_uploaded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn blocks_handled(&self) -> u64 {
        self.blocks_handled.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count.load(Ordering::Relaxed)
    }

    pub fn flushed_rows(&self) -> u64 {
        self.flushed_rows.load(Ordering::Relaxed)
    }

    pub fn flush_duration(&self) -> Duration {
        Duration::from_nanos(self.flush_duration_ns.load(Ordering::Relaxed))
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Relaxed)
    }

    pub fn bundles_uploaded(&self) -> u64 {
        self.bundles_uploaded.load(Ordering::Relaxed)
    }
}

/// The process-wide counter bag.
pub fn metrics() -> &'static Metrics {
    static METRICS: OnceLock<Metrics> = OnceLock::new();
    METRICS.get_or_init(Metrics::default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let m = Metrics::default();
        m.record_block();
        m.record_block();
        m.record_flush(10, Duration::from_millis(3));
        assert_eq!(m.blocks_handled(), 2);
        assert_eq!(m.flush_count(), 1);
        assert_eq!(m.flushed_rows(), 10);
        assert_eq!(m.flush_duration(), Duration::from_millis(3));
    }
}
