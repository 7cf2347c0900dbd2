use crate::error::StoreError;
use crate::model::{DeviceRegistration, DeviceState, DeviceStatus, LocationRecord, StatusUpdate};
use crate::store::{LocationQuery, LocationStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

/// In-memory implementation of both tables
#[derive(Debug, Default, Clone)]
pub struct InMemoryLocationStore {
    locations: Arc<RwLock<HashMap<String, BTreeMap<i64, LocationRecord>>>>,
    devices: Arc<RwLock<HashMap<String, DeviceStatus>>>,
}

impl InMemoryLocationStore {
    pub fn new() -> Self {
        debug!("Initializing in-memory location store");
        Self::default()
    }

    /// Number of location rows across all devices
    pub async fn location_count(&self) -> usize {
        self.locations.read().await.values().map(BTreeMap::len).sum()
    }

    /// Stored location row for an exact key
    pub async fn location(&self, device_id: &str, timestamp: i64) -> Option<LocationRecord> {
        self.locations
            .read()
            .await
            .get(device_id)
            .and_then(|rows| rows.get(&timestamp))
            .cloned()
    }
}

#[async_trait]
impl LocationStore for InMemoryLocationStore {
    #[instrument(skip(self, chunk), fields(count = chunk.len()))]
    async fn put_locations(&self, chunk: &[LocationRecord]) -> Result<(), StoreError> {
        let mut locations = self.locations.write().await;
        for record in chunk {
            locations
                .entry(record.device_id().to_string())
                .or_default()
                .insert(record.timestamp(), record.clone());
        }
        trace!(count = chunk.len(), "Locations written to memory");
        Ok(())
    }

    async fn upsert_status(&self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let status = devices
            .entry(update.device_id.clone())
            .or_insert_with(|| DeviceStatus::registered(update.device_id.clone(), now));

        status.last_seen = Some(update.last_seen);
        status.last_location = Some(update.last_location);
        status.status = DeviceState::Active;
        status.total_updates += 1;
        Ok(())
    }

    async fn tables_active(&self) -> Result<bool, StoreError> {
        Ok(true)
    }

    async fn query_locations(&self, query: &LocationQuery) -> Result<Vec<LocationRecord>, StoreError> {
        let locations = self.locations.read().await;
        let rows = match locations.get(&query.device_id) {
            Some(rows) => rows,
            None => return Ok(Vec::new()),
        };

        Ok(rows
            .iter()
            .rev()
            .filter(|(ts, _)| query.contains(**ts))
            .take(query.limit)
            .map(|(_, record)| record.clone())
            .collect())
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceStatus>, StoreError> {
        Ok(self.devices.read().await.get(device_id).cloned())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceStatus>, StoreError> {
        let mut devices: Vec<DeviceStatus> = self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        Ok(devices)
    }

    async fn register_device(
        &self,
        device_id: &str,
        registration: &DeviceRegistration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut devices = self.devices.write().await;
        let status = devices
            .entry(device_id.to_string())
            .or_insert_with(|| DeviceStatus::registered(device_id, now));
        status.attributes = registration.attributes.clone();
        Ok(())
    }
}
