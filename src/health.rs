//! Process-wide consumer counters
//!
//! Every partition cursor writes into one shared [`ConsumerHealth`]. Counters
//! are plain atomics, so the hot path never takes a lock; only the last
//! sequence number sits behind a short-lived mutex.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

const NO_RECORD: i64 = i64::MIN;

/// Windows used by the liveness decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthWindows {
    /// Healthy without any records for this long after start
    pub startup_grace: Duration,
    /// Unhealthy once the last stored record is older than this
    pub stale_after: Duration,
}

impl Default for HealthWindows {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(300),
            stale_after: Duration::from_secs(300),
        }
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthSnapshot {
    pub is_running: bool,
    pub records_processed: u64,
    pub error_count: u64,
    pub last_record_time: Option<DateTime<Utc>>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_sequence_number: Option<String>,
    pub active_partitions: usize,
}

#[derive(Debug)]
pub struct ConsumerHealth {
    windows: HealthWindows,
    running: AtomicBool,
    records_processed: AtomicU64,
    error_count: AtomicU64,
    last_record_ms: AtomicI64,
    start_ms: AtomicI64,
    active_partitions: AtomicUsize,
    last_sequence_number: Mutex<Option<String>>,
}

impl Default for ConsumerHealth {
    fn default() -> Self {
        Self::new(HealthWindows::default())
    }
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    if ms == NO_RECORD {
        None
    } else {
        DateTime::from_timestamp_millis(ms)
    }
}

impl ConsumerHealth {
    pub fn new(windows: HealthWindows) -> Self {
        Self {
            windows,
            running: AtomicBool::new(false),
            records_processed: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            last_record_ms: AtomicI64::new(NO_RECORD),
            start_ms: AtomicI64::new(NO_RECORD),
            active_partitions: AtomicUsize::new(0),
            last_sequence_number: Mutex::new(None),
        }
    }

    pub fn windows(&self) -> HealthWindows {
        self.windows
    }

    pub fn mark_started(&self, now: DateTime<Utc>) {
        self.start_ms.store(now.timestamp_millis(), Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Account for `count` stored records; a zero count leaves the clock alone
    pub fn record_stored(&self, count: usize, last_sequence: Option<&str>, at: DateTime<Utc>) {
        if count == 0 {
            return;
        }
        self.records_processed.fetch_add(count as u64, Ordering::SeqCst);
        self.last_record_ms.fetch_max(at.timestamp_millis(), Ordering::SeqCst);
        if let Some(sequence) = last_sequence {
            *self.last_sequence_number.lock() = Some(sequence.to_string());
        }
    }

    pub fn record_errors(&self, count: usize) {
        if count > 0 {
            self.error_count.fetch_add(count as u64, Ordering::SeqCst);
        }
    }

    pub fn set_active_partitions(&self, count: usize) {
        self.active_partitions.store(count, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn records_processed(&self) -> u64 {
        self.records_processed.load(Ordering::SeqCst)
    }

    pub fn error_count(&self) -> u64 {
        self.error_count.load(Ordering::SeqCst)
    }

    pub fn last_record_time(&self) -> Option<DateTime<Utc>> {
        from_millis(self.last_record_ms.load(Ordering::SeqCst))
    }

    pub fn start_time(&self) -> Option<DateTime<Utc>> {
        from_millis(self.start_ms.load(Ordering::SeqCst))
    }

    pub fn last_sequence_number(&self) -> Option<String> {
        self.last_sequence_number.lock().clone()
    }

    /// Liveness as of `now`.
    ///
    /// Not running is unhealthy. With no records yet, healthy only inside the
    /// startup grace period. Otherwise healthy while the last stored record is
    /// no older than the stale window.
    pub fn is_healthy_at(&self, now: DateTime<Utc>) -> bool {
        if !self.is_running() {
            return false;
        }

        if self.records_processed() == 0 {
            return match self.start_time() {
                Some(start) => elapsed(start, now) < self.windows.startup_grace,
                None => false,
            };
        }

        match self.last_record_time() {
            Some(last) => elapsed(last, now) <= self.windows.stale_after,
            None => false,
        }
    }

    /// Milliseconds since the last stored record, `None` before the first one
    pub fn lag_ms_at(&self, now: DateTime<Utc>) -> Option<i64> {
        self.last_record_time()
            .map(|last| (now - last).num_milliseconds().max(0))
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            is_running: self.is_running(),
            records_processed: self.records_processed(),
            error_count: self.error_count(),
            last_record_time: self.last_record_time(),
            start_time: self.start_time(),
            last_sequence_number: self.last_sequence_number(),
            active_partitions: self.active_partitions.load(Ordering::SeqCst),
        }
    }
}

fn elapsed(from: DateTime<Utc>, to: DateTime<Utc>) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}
