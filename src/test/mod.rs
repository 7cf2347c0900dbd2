//! Test utilities and mock implementations


use crate::client::{RecordBatch, StreamRecord};
use crate::model::LocationPayload;
use bytes::Bytes;
use std::sync::Once;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test-writer subscriber once per test binary
pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(
                    "trackstore=debug"
                        .parse()
                        .unwrap_or_else(|_| tracing::Level::DEBUG.into()),
                ),
            )
            .with_test_writer()
            .with_thread_ids(true)
            .try_init()
            .ok();
    });
}

/// Helper functions for creating test data
pub struct TestUtils;

impl TestUtils {
    pub fn stream_record(sequence_number: &str, data: &[u8]) -> StreamRecord {
        StreamRecord {
            sequence_number: sequence_number.to_string(),
            partition_key: "test-partition-key".to_string(),
            data: Bytes::copy_from_slice(data),
            approximate_arrival: None,
        }
    }

    /// JSON payload in the stream's wire format
    pub fn location_json(bus_id: &str, lat: f64, lon: f64, ts: i64) -> Vec<u8> {
        serde_json::to_vec(&LocationPayload::new(bus_id, lat, lon, ts)).unwrap_or_default()
    }

    pub fn location_record(sequence_number: &str, bus_id: &str, lat: f64, lon: f64, ts: i64) -> StreamRecord {
        StreamRecord {
            partition_key: bus_id.to_string(),
            ..Self::stream_record(sequence_number, &Self::location_json(bus_id, lat, lon, ts))
        }
    }

    /// An open batch; the mock client replaces the iterator with a routed one
    pub fn batch(records: Vec<StreamRecord>) -> RecordBatch {
        RecordBatch {
            records,
            next_iterator: Some("next".to_string()),
            millis_behind_latest: Some(0),
        }
    }

    /// Final batch of a closed partition
    pub fn closed_batch(records: Vec<StreamRecord>) -> RecordBatch {
        RecordBatch {
            records,
            next_iterator: None,
            millis_behind_latest: None,
        }
    }
}

/// Poll `check` until it holds or `timeout` elapses
pub async fn wait_for_condition<F>(mut check: F, timeout: Duration) -> anyhow::Result<()>
where
    F: FnMut() -> bool,
{
    let start = tokio::time::Instant::now();
    while !check() {
        if start.elapsed() > timeout {
            anyhow::bail!("Condition not met within timeout");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LocationRecord;

    #[test]
    fn test_location_record_helper() {
        let record = TestUtils::location_record("seq-1", "bus-1", 43.47, -80.54, 1000);
        assert_eq!(record.sequence_number, "seq-1");
        assert_eq!(record.partition_key, "bus-1");

        let decoded = LocationRecord::decode(&record.data).unwrap();
        assert_eq!(decoded.device_id(), "bus-1");
        assert_eq!(decoded.timestamp(), 1000);
    }

    #[test]
    fn test_batch_helpers() {
        assert!(TestUtils::batch(vec![]).next_iterator.is_some());
        assert!(TestUtils::closed_batch(vec![]).next_iterator.is_none());
    }
}
