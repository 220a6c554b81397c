//! Extraction and load counters. One recorder per source and per ingester;
//! increments are atomic so shard tasks can share a recorder without locks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct StatsRecorder {
    started: Instant,
    rows: AtomicU64,
    bytes: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            rows: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    pub fn record_rows(&self, rows: u64) {
        self.rows.fetch_add(rows, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn rows(&self) -> u64 {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Cumulative rows per second since this recorder was created.
    pub fn rows_per_second(&self) -> f64 {
        let secs = self.started.elapsed().as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.rows() as f64 / secs
    }
}

impl Default for StatsRecorder {
    fn default() -> Self {
        Self::new()
    }
}
