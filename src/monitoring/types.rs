use std::time::{Duration, SystemTime};

/// Configuration for the monitoring channel
#[derive(Debug, Clone)]
pub struct MonitoringConfig {
    /// Whether cursors publish events at all
    pub enabled: bool,
    /// Size of the monitoring channel buffer
    pub channel_size: usize,
    /// How often the aggregator logs per-partition metrics
    pub metrics_interval: Duration,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            channel_size: 1000,
            metrics_interval: Duration::from_secs(60),
        }
    }
}

/// A telemetry event published by a partition cursor
#[derive(Debug, Clone)]
pub struct IngestEvent {
    pub timestamp: SystemTime,
    pub partition_id: String,
    pub event_type: IngestEventType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IngestEventType {
    /// A fetch returned successfully, possibly with no records
    Fetched {
        record_count: usize,
        millis_behind_latest: Option<i64>,
    },
    /// A non-empty fetch was decoded and handed to the store
    BatchStored {
        submitted: usize,
        stored: usize,
        decode_failures: usize,
        duration: Duration,
    },
    FetchFailed {
        error: String,
        consecutive_errors: u32,
    },
    Iterator {
        event_type: IteratorEventType,
        error: Option<String>,
    },
    Partition {
        event_type: PartitionEventType,
        details: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorEventType {
    /// First iterator for the partition
    Initial,
    /// Fresh iterator obtained after a backoff
    Reacquired,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionEventType {
    Started,
    /// The partition was closed and fully read
    Closed,
    /// Stopped by the consumer
    Stopped,
    /// Ended after an unrecoverable iterator failure
    Terminated,
}

impl IngestEvent {
    fn new(partition_id: &str, event_type: IngestEventType) -> Self {
        Self {
            timestamp: SystemTime::now(),
            partition_id: partition_id.to_string(),
            event_type,
        }
    }

    pub fn fetched(partition_id: &str, record_count: usize, millis_behind_latest: Option<i64>) -> Self {
        Self::new(
            partition_id,
            IngestEventType::Fetched {
                record_count,
                millis_behind_latest,
            },
        )
    }

    pub fn batch_stored(
        partition_id: &str,
        submitted: usize,
        stored: usize,
        decode_failures: usize,
        duration: Duration,
    ) -> Self {
        Self::new(
            partition_id,
            IngestEventType::BatchStored {
                submitted,
                stored,
                decode_failures,
                duration,
            },
        )
    }

    pub fn fetch_failed(partition_id: &str, error: String, consecutive_errors: u32) -> Self {
        Self::new(
            partition_id,
            IngestEventType::FetchFailed {
                error,
                consecutive_errors,
            },
        )
    }

    pub fn iterator(partition_id: &str, event_type: IteratorEventType, error: Option<String>) -> Self {
        Self::new(partition_id, IngestEventType::Iterator { event_type, error })
    }

    pub fn partition(partition_id: &str, event_type: PartitionEventType, details: Option<String>) -> Self {
        Self::new(partition_id, IngestEventType::Partition { event_type, details })
    }
}
