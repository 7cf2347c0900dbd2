//! Durable storage for location history and device status
//!
//! [`LocationStore`] implementations perform exactly one physical operation
//! per call. Chunking, retries, timeouts and the status-upsert contract live
//! in [`StoreAdapter`], so every backend gets the same write semantics.

use crate::error::StoreError;
use crate::model::{DeviceRegistration, DeviceStatus, LocationRecord, StatusUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod adapter;
pub mod dynamodb;
pub mod memory;

pub use adapter::{StoreAdapter, StoreConfig};
pub use dynamodb::DynamoDbLocationStore;
pub use memory::InMemoryLocationStore;

/// Range query over one device's location history
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationQuery {
    pub device_id: String,
    /// Inclusive lower bound, epoch milliseconds
    pub start_time: Option<i64>,
    /// Inclusive upper bound, epoch milliseconds
    pub end_time: Option<i64>,
    pub limit: usize,
}

impl LocationQuery {
    pub fn new(device_id: impl Into<String>, limit: usize) -> Self {
        Self {
            device_id: device_id.into(),
            start_time: None,
            end_time: None,
            limit,
        }
    }

    pub fn between(mut self, start_time: Option<i64>, end_time: Option<i64>) -> Self {
        self.start_time = start_time;
        self.end_time = end_time;
        self
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        self.start_time.map_or(true, |start| timestamp >= start)
            && self.end_time.map_or(true, |end| timestamp <= end)
    }
}

/// Backend for the location-history and device-status tables
#[async_trait]
pub trait LocationStore: Send + Sync {
    /// Write one chunk of location rows in a single batch call.
    /// Rows are keyed by `(device_id, timestamp)`; rewriting a key is idempotent.
    async fn put_locations(&self, chunk: &[LocationRecord]) -> Result<(), StoreError>;

    /// Apply one stored location to the device's status row, creating it if absent
    async fn upsert_status(&self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// True when both tables report an operational status
    async fn tables_active(&self) -> Result<bool, StoreError>;

    /// Most-recent-first, at most `query.limit` rows
    async fn query_locations(&self, query: &LocationQuery) -> Result<Vec<LocationRecord>, StoreError>;

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceStatus>, StoreError>;

    async fn list_devices(&self) -> Result<Vec<DeviceStatus>, StoreError>;

    /// Create the device row if absent; replace its attributes otherwise
    async fn register_device(
        &self,
        device_id: &str,
        registration: &DeviceRegistration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;
}
