//! Input stream access
//!
//! [`StreamClient`] is the seam between the engine and the partitioned event
//! log. The AWS Kinesis implementation classifies SDK failures into
//! [`StreamClientError`] so the cursor can tell throttling from a missing
//! stream without string matching.

use crate::error::StreamClientError;
use async_trait::async_trait;
use aws_sdk_kinesis::{
    error::{DisplayErrorContext, ProvideErrorMetadata, SdkError},
    types::{Record, ShardIteratorType},
    Client,
};
use aws_smithy_types_convert::date_time::DateTimeExt;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use tracing::{debug, trace};

/// Where a newly acquired iterator starts reading
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartingPosition {
    /// Only records written after the iterator is acquired
    Latest,
    /// Oldest record still retained by the stream
    TrimHorizon,
    /// Immediately after a known sequence number
    AfterSequenceNumber(String),
}

impl StartingPosition {
    pub fn iterator_type(&self) -> ShardIteratorType {
        match self {
            StartingPosition::Latest => ShardIteratorType::Latest,
            StartingPosition::TrimHorizon => ShardIteratorType::TrimHorizon,
            StartingPosition::AfterSequenceNumber(_) => ShardIteratorType::AfterSequenceNumber,
        }
    }

    pub fn sequence_number(&self) -> Option<&str> {
        match self {
            StartingPosition::AfterSequenceNumber(seq) => Some(seq),
            _ => None,
        }
    }

    /// Position to use when reacquiring an iterator mid-run.
    ///
    /// Only sequence-number positioning resumes from the cursor's progress;
    /// `Latest` and `TrimHorizon` are reapplied as configured.
    pub fn resume_from(&self, last_sequence_number: Option<&str>) -> StartingPosition {
        match (self, last_sequence_number) {
            (StartingPosition::AfterSequenceNumber(_), Some(last)) => {
                StartingPosition::AfterSequenceNumber(last.to_string())
            }
            _ => self.clone(),
        }
    }
}

/// One raw record as delivered by the stream
#[derive(Debug, Clone, PartialEq)]
pub struct StreamRecord {
    pub sequence_number: String,
    pub partition_key: String,
    pub data: Bytes,
    pub approximate_arrival: Option<DateTime<Utc>>,
}

impl From<&Record> for StreamRecord {
    fn from(record: &Record) -> Self {
        Self {
            sequence_number: record.sequence_number().to_string(),
            partition_key: record.partition_key().unwrap_or_default().to_string(),
            data: Bytes::copy_from_slice(record.data().as_ref()),
            approximate_arrival: record
                .approximate_arrival_timestamp()
                .and_then(|ts| ts.to_chrono_utc().ok()),
        }
    }
}

/// Result of one fetch against a partition iterator
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    pub records: Vec<StreamRecord>,
    /// `None` once the partition is closed and fully read
    pub next_iterator: Option<String>,
    pub millis_behind_latest: Option<i64>,
}

#[async_trait]
pub trait StreamClient: Send + Sync {
    /// Current partition ids of the stream
    async fn list_partitions(&self, stream_name: &str) -> Result<Vec<String>, StreamClientError>;

    async fn get_iterator(
        &self,
        stream_name: &str,
        partition_id: &str,
        position: &StartingPosition,
    ) -> Result<String, StreamClientError>;

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, StreamClientError>;
}

#[async_trait]
impl StreamClient for Client {
    async fn list_partitions(&self, stream_name: &str) -> Result<Vec<String>, StreamClientError> {
        let mut partitions = Vec::new();
        let mut next_token: Option<String> = None;

        loop {
            // StreamName and NextToken are mutually exclusive on ListShards
            let request = match &next_token {
                Some(token) => self.list_shards().next_token(token),
                None => self.list_shards().stream_name(stream_name),
            };
            let response = request.send().await.map_err(classify)?;

            partitions.extend(response.shards().iter().map(|s| s.shard_id().to_string()));

            match response.next_token() {
                Some(token) => next_token = Some(token.to_string()),
                None => break,
            }
        }

        debug!(stream = %stream_name, count = partitions.len(), "Listed partitions");
        Ok(partitions)
    }

    async fn get_iterator(
        &self,
        stream_name: &str,
        partition_id: &str,
        position: &StartingPosition,
    ) -> Result<String, StreamClientError> {
        let mut req = self
            .get_shard_iterator()
            .stream_name(stream_name)
            .shard_id(partition_id)
            .shard_iterator_type(position.iterator_type());

        if let Some(seq) = position.sequence_number() {
            req = req.starting_sequence_number(seq);
        }

        let response = req.send().await.map_err(classify)?;
        response
            .shard_iterator()
            .map(String::from)
            .ok_or_else(|| StreamClientError::Other("GetShardIterator returned no iterator".to_string()))
    }

    async fn get_records(&self, iterator: &str, limit: i32) -> Result<RecordBatch, StreamClientError> {
        let response = self
            .get_records()
            .shard_iterator(iterator)
            .limit(limit)
            .send()
            .await
            .map_err(classify)?;

        trace!(
            count = response.records().len(),
            millis_behind = ?response.millis_behind_latest(),
            "Fetched records"
        );

        Ok(RecordBatch {
            records: response.records().iter().map(StreamRecord::from).collect(),
            next_iterator: response.next_shard_iterator().map(String::from),
            millis_behind_latest: response.millis_behind_latest(),
        })
    }
}

fn classify<E, R>(err: SdkError<E, R>) -> StreamClientError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StreamClientError::Connection(message)
        }
        _ => classify_code(err.code(), message),
    }
}

/// Map a service error code onto the engine's failure classes
pub(crate) fn classify_code(code: Option<&str>, message: String) -> StreamClientError {
    match code {
        Some("ExpiredIteratorException") => StreamClientError::ExpiredIterator,
        Some("ProvisionedThroughputExceededException")
        | Some("LimitExceededException")
        | Some("ThrottlingException")
        | Some("KMSThrottlingException") => StreamClientError::Throttled,
        Some("AccessDeniedException") | Some("KMSAccessDeniedException") => {
            StreamClientError::AccessDenied(message)
        }
        Some("ResourceNotFoundException") => StreamClientError::ResourceNotFound(message),
        Some("InvalidArgumentException") => StreamClientError::InvalidArgument(message),
        _ => StreamClientError::Other(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iterator_types() {
        assert_eq!(StartingPosition::Latest.iterator_type(), ShardIteratorType::Latest);
        assert_eq!(
            StartingPosition::TrimHorizon.iterator_type(),
            ShardIteratorType::TrimHorizon
        );
        let after = StartingPosition::AfterSequenceNumber("42".into());
        assert_eq!(after.iterator_type(), ShardIteratorType::AfterSequenceNumber);
        assert_eq!(after.sequence_number(), Some("42"));
        assert_eq!(StartingPosition::Latest.sequence_number(), None);
    }

    #[test]
    fn test_resume_position() {
        let after = StartingPosition::AfterSequenceNumber("10".into());
        assert_eq!(
            after.resume_from(Some("25")),
            StartingPosition::AfterSequenceNumber("25".into())
        );
        assert_eq!(after.resume_from(None), after);
        assert_eq!(
            StartingPosition::Latest.resume_from(Some("25")),
            StartingPosition::Latest
        );
        assert_eq!(
            StartingPosition::TrimHorizon.resume_from(Some("25")),
            StartingPosition::TrimHorizon
        );
    }

    #[test]
    fn test_error_code_classification() {
        assert_eq!(
            classify_code(Some("ExpiredIteratorException"), String::new()),
            StreamClientError::ExpiredIterator
        );
        assert_eq!(
            classify_code(Some("ProvisionedThroughputExceededException"), String::new()),
            StreamClientError::Throttled
        );
        assert!(matches!(
            classify_code(Some("AccessDeniedException"), "denied".into()),
            StreamClientError::AccessDenied(m) if m == "denied"
        ));
        assert!(matches!(
            classify_code(Some("ResourceNotFoundException"), String::new()),
            StreamClientError::ResourceNotFound(_)
        ));
        assert!(matches!(
            classify_code(None, "boom".into()),
            StreamClientError::Other(m) if m == "boom"
        ));
    }

    #[test]
    fn test_stream_record_from_sdk_record() {
        let record = Record::builder()
            .sequence_number("49590338271490256608559692538361571095921575989136588898")
            .partition_key("bus-1")
            .data(aws_smithy_types::Blob::new(b"{}".to_vec()))
            .approximate_arrival_timestamp(aws_smithy_types::DateTime::from_secs(1_700_000_000))
            .build()
            .expect("valid record");

        let converted = StreamRecord::from(&record);
        assert_eq!(converted.partition_key, "bus-1");
        assert_eq!(converted.data.as_ref(), b"{}");
        assert_eq!(
            converted.approximate_arrival.map(|t| t.timestamp()),
            Some(1_700_000_000)
        );
    }
}
