//! Partition-level telemetry
//!
//! Cursors publish [`IngestEvent`]s on an optional channel; the
//! [`MetricsAggregator`] folds them into [`PartitionMetrics`] and logs a
//! summary per window.

mod metrics;
mod types;

pub use metrics::{MetricsAggregator, PartitionMetrics};
pub use types::{
    IngestEvent, IngestEventType, IteratorEventType, MonitoringConfig, PartitionEventType,
};
