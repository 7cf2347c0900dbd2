use super::types::{IngestEvent, IngestEventType, IteratorEventType, PartitionEventType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;
use tracing::{debug, info, trace, warn};

/// Aggregated counters for a single partition
#[derive(Debug, Clone)]
pub struct PartitionMetrics {
    pub records_stored: u64,
    pub records_failed: u64,
    pub decode_failures: u64,
    pub batches: u64,
    pub empty_polls: u64,
    pub fetch_failures: u64,
    pub iterator_reacquisitions: u64,
    pub iterator_failures: u64,
    /// Source-reported distance from the tip of the partition
    pub millis_behind_latest: Option<i64>,
    pub store_time: Duration,
    pub max_batch_time: Duration,
    pub finished: Option<PartitionEventType>,
    pub last_updated: Instant,
}

impl Default for PartitionMetrics {
    fn default() -> Self {
        Self {
            records_stored: 0,
            records_failed: 0,
            decode_failures: 0,
            batches: 0,
            empty_polls: 0,
            fetch_failures: 0,
            iterator_reacquisitions: 0,
            iterator_failures: 0,
            millis_behind_latest: None,
            store_time: Duration::default(),
            max_batch_time: Duration::default(),
            finished: None,
            last_updated: Instant::now(),
        }
    }
}

impl PartitionMetrics {
    pub fn avg_batch_time(&self) -> Duration {
        if self.batches == 0 {
            Duration::ZERO
        } else {
            self.store_time.div_f64(self.batches as f64)
        }
    }
}

/// Folds cursor events into per-partition metrics
pub struct MetricsAggregator {
    metrics: Arc<RwLock<HashMap<String, PartitionMetrics>>>,
    window_duration: Duration,
    monitoring_rx: mpsc::Receiver<IngestEvent>,
}

impl MetricsAggregator {
    pub fn new(window_duration: Duration, monitoring_rx: mpsc::Receiver<IngestEvent>) -> Self {
        Self {
            metrics: Arc::new(RwLock::new(HashMap::new())),
            window_duration,
            monitoring_rx,
        }
    }

    /// Shared view of the metrics, readable while [`run`](Self::run) owns the aggregator
    pub fn handle(&self) -> Arc<RwLock<HashMap<String, PartitionMetrics>>> {
        self.metrics.clone()
    }

    /// Consume events until every sender is dropped
    pub async fn run(mut self) {
        let mut interval = interval(self.window_duration);

        loop {
            tokio::select! {
                event = self.monitoring_rx.recv() => match event {
                    Some(event) => self.process_event(event).await,
                    None => break,
                },
                _ = interval.tick() => {
                    self.emit_metrics().await;
                }
            }
        }

        self.emit_metrics().await;
        debug!("Monitoring channel closed, aggregator stopped");
    }

    pub async fn process_event(&self, event: IngestEvent) {
        let mut metrics = self.metrics.write().await;
        let partition = metrics.entry(event.partition_id.clone()).or_default();

        match event.event_type {
            IngestEventType::Fetched {
                record_count,
                millis_behind_latest,
            } => {
                if record_count == 0 {
                    partition.empty_polls += 1;
                }
                if millis_behind_latest.is_some() {
                    partition.millis_behind_latest = millis_behind_latest;
                }
            }
            IngestEventType::BatchStored {
                submitted,
                stored,
                decode_failures,
                duration,
            } => {
                partition.batches += 1;
                partition.records_stored += stored as u64;
                partition.records_failed += submitted.saturating_sub(stored) as u64;
                partition.decode_failures += decode_failures as u64;
                partition.store_time += duration;
                partition.max_batch_time = partition.max_batch_time.max(duration);
                trace!(
                    partition_id = %event.partition_id,
                    submitted = submitted,
                    stored = stored,
                    "Batch stored"
                );
            }
            IngestEventType::FetchFailed {
                error,
                consecutive_errors,
            } => {
                partition.fetch_failures += 1;
                debug!(
                    partition_id = %event.partition_id,
                    error = %error,
                    consecutive_errors = consecutive_errors,
                    "Fetch failed"
                );
            }
            IngestEventType::Iterator { event_type, error } => match event_type {
                IteratorEventType::Initial => {
                    trace!(partition_id = %event.partition_id, "Initial iterator acquired");
                }
                IteratorEventType::Reacquired => {
                    partition.iterator_reacquisitions += 1;
                }
                IteratorEventType::Failed => {
                    partition.iterator_failures += 1;
                    warn!(partition_id = %event.partition_id, error = ?error, "Iterator acquisition failed");
                }
            },
            IngestEventType::Partition {
                event_type,
                details,
            } => {
                partition.finished = match event_type {
                    PartitionEventType::Started => None,
                    other => Some(other),
                };
                debug!(
                    partition_id = %event.partition_id,
                    event = ?event_type,
                    details = ?details,
                    "Partition lifecycle event"
                );
            }
        }

        partition.last_updated = Instant::now();
    }

    async fn emit_metrics(&self) {
        let metrics = self.metrics.read().await;

        for (partition_id, metrics) in metrics.iter() {
            if metrics.last_updated.elapsed() > self.window_duration * 2 {
                continue;
            }

            info!(
                partition_id = %partition_id,
                records_stored = metrics.records_stored,
                records_failed = metrics.records_failed,
                decode_failures = metrics.decode_failures,
                batches = metrics.batches,
                empty_polls = metrics.empty_polls,
                millis_behind_latest = ?metrics.millis_behind_latest,
                avg_batch_time_ms = %metrics.avg_batch_time().as_millis(),
                max_batch_time_ms = %metrics.max_batch_time.as_millis(),
                "Metrics for window"
            );

            if metrics.fetch_failures > 0 || metrics.iterator_failures > 0 {
                warn!(
                    partition_id = %partition_id,
                    fetch_failures = metrics.fetch_failures,
                    iterator_failures = metrics.iterator_failures,
                    "Stream failures detected"
                );
            }
        }
        drop(metrics);

        if let Ok(mut metrics) = self.metrics.try_write() {
            metrics.retain(|_, m| m.last_updated.elapsed() <= self.window_duration * 2);
        }
    }

    pub async fn get_metrics(&self) -> HashMap<String, PartitionMetrics> {
        self.metrics.read().await.clone()
    }

    pub async fn get_partition_metrics(&self, partition_id: &str) -> Option<PartitionMetrics> {
        self.metrics.read().await.get(partition_id).cloned()
    }
}
