use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;
use trackstore::error::StreamClientError;
use trackstore::model::LocationPayload;
use trackstore::{ConsumerConfig, RecordBatch, StartingPosition, StreamClient, StreamRecord};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("trackstore=debug".parse().unwrap()),
            )
            .with_test_writer()
            .try_init()
            .ok();
    });
}

pub fn test_config() -> ConsumerConfig {
    ConsumerConfig {
        stream_name: "gps-stream".to_string(),
        starting_position: StartingPosition::TrimHorizon,
        poll_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

pub fn location(sequence_number: u64, bus_id: &str, lat: f64, lon: f64, ts: i64) -> StreamRecord {
    StreamRecord {
        sequence_number: sequence_number.to_string(),
        partition_key: bus_id.to_string(),
        data: Bytes::from(serde_json::to_vec(&LocationPayload::new(bus_id, lat, lon, ts)).unwrap()),
        approximate_arrival: None,
    }
}

#[derive(Default)]
struct Partition {
    records: Vec<StreamRecord>,
    closed: bool,
}

/// Replays fixed records; iterators are `"{partition}@{offset}"`
#[derive(Clone, Default)]
pub struct ScriptedStream {
    partitions: Arc<Mutex<HashMap<String, Partition>>>,
    page_size: usize,
}

impl ScriptedStream {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            ..Default::default()
        }
    }

    pub fn add_partition(&self, partition_id: &str, records: Vec<StreamRecord>, closed: bool) {
        self.partitions
            .lock()
            .unwrap()
            .insert(partition_id.to_string(), Partition { records, closed });
    }
}

#[async_trait]
impl StreamClient for ScriptedStream {
    async fn list_partitions(&self, _stream_name: &str) -> Result<Vec<String>, StreamClientError> {
        let mut ids: Vec<String> = self.partitions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn get_iterator(
        &self,
        _stream_name: &str,
        partition_id: &str,
        _position: &StartingPosition,
    ) -> Result<String, StreamClientError> {
        if !self.partitions.lock().unwrap().contains_key(partition_id) {
            return Err(StreamClientError::ResourceNotFound(partition_id.to_string()));
        }
        Ok(format!("{partition_id}@0"))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, StreamClientError> {
        let (partition_id, offset) = iterator
            .split_once('@')
            .and_then(|(p, o)| Some((p.to_string(), o.parse::<usize>().ok()?)))
            .ok_or(StreamClientError::ExpiredIterator)?;

        let partitions = self.partitions.lock().unwrap();
        let partition = partitions
            .get(&partition_id)
            .ok_or_else(|| StreamClientError::ResourceNotFound(partition_id.clone()))?;

        let end = (offset + self.page_size.min(limit as usize)).min(partition.records.len());
        let records = partition.records[offset..end].to_vec();
        let next_iterator = if partition.closed && end == partition.records.len() {
            None
        } else {
            Some(format!("{partition_id}@{end}"))
        };

        Ok(RecordBatch {
            records,
            next_iterator,
            millis_behind_latest: Some(0),
        })
    }
}
