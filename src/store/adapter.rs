use crate::error::{IngestError, StoreError};
use crate::model::{DeviceRegistration, DeviceStatus, LocationRecord, StatusUpdate};
use crate::retry::RetryConfig;
use crate::store::{LocationQuery, LocationStore};
use chrono::Utc;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Write-path settings for [`StoreAdapter`]
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Largest chunk handed to a single batch write
    pub chunk_size: usize,
    /// Upper bound on any single store call
    pub call_timeout: Duration,
    /// Retry policy applied to each chunk write and each status upsert
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            chunk_size: 25,
            call_timeout: Duration::from_secs(10),
            retry: RetryConfig::default(),
        }
    }
}

/// Batched, idempotent persistence of locations and device status
pub struct StoreAdapter<S: LocationStore> {
    store: Arc<S>,
    config: StoreConfig,
}

impl<S: LocationStore> Clone for StoreAdapter<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S: LocationStore> StoreAdapter<S> {
    pub fn new(store: S, config: StoreConfig) -> Self {
        Self {
            store: Arc::new(store),
            config: StoreConfig {
                chunk_size: config.chunk_size.max(1),
                ..config
            },
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    async fn timed<T>(&self, call: impl Future<Output = Result<T, StoreError>>) -> Result<T, StoreError> {
        tokio::time::timeout(self.config.call_timeout, call)
            .await
            .map_err(|_| StoreError::Timeout(self.config.call_timeout))?
    }

    /// Persist `records`, returning how many were fully stored.
    ///
    /// A record counts as stored once its chunk was written and its device
    /// status upsert succeeded. Failed chunks are dropped after the retry
    /// policy is exhausted; the remaining chunks are still attempted.
    #[instrument(skip(self, records), fields(count = records.len()))]
    pub async fn store_batch(&self, records: &[LocationRecord]) -> usize {
        let mut stored = 0;

        for (index, chunk) in records.chunks(self.config.chunk_size).enumerate() {
            let written = self
                .config
                .retry
                .run(|| self.timed(self.store.put_locations(chunk)))
                .await;

            if let Err(e) = written {
                error!(
                    chunk = index,
                    size = chunk.len(),
                    error = %e,
                    "Chunk write failed, records dropped"
                );
                continue;
            }

            stored += self.apply_status_updates(chunk).await;
        }

        debug!(submitted = records.len(), stored = stored, "Batch stored");
        stored
    }

    async fn apply_status_updates(&self, chunk: &[LocationRecord]) -> usize {
        let mut last_seen: HashMap<&str, i64> = HashMap::new();
        for record in chunk {
            last_seen
                .entry(record.device_id())
                .and_modify(|ts| *ts = (*ts).max(record.timestamp()))
                .or_insert(record.timestamp());
        }

        let mut applied = 0;
        for record in chunk {
            let update = StatusUpdate {
                device_id: record.device_id().to_string(),
                last_seen: last_seen[record.device_id()],
                last_location: record.coordinates(),
            };

            match self
                .config
                .retry
                .run(|| self.timed(self.store.upsert_status(&update, Utc::now())))
                .await
            {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(
                        device_id = %update.device_id,
                        timestamp = record.timestamp(),
                        error = %e,
                        "Device status upsert failed"
                    );
                }
            }
        }
        applied
    }

    /// True only if both tables are operational; errors count as unhealthy
    pub async fn health_check(&self) -> bool {
        match self.timed(self.store.tables_active()).await {
            Ok(active) => active,
            Err(e) => {
                error!(error = %e, "Store health check failed");
                false
            }
        }
    }

    /// Location history for a device, most recent first
    pub async fn query_locations(
        &self,
        device_id: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: usize,
    ) -> Result<Vec<LocationRecord>, IngestError> {
        let query = LocationQuery::new(device_id, limit).between(start_time, end_time);
        Ok(self.timed(self.store.query_locations(&query)).await?)
    }

    pub async fn latest_location(&self, device_id: &str) -> Result<Option<LocationRecord>, IngestError> {
        Ok(self
            .query_locations(device_id, None, None, 1)
            .await?
            .into_iter()
            .next())
    }

    pub async fn device_status(&self, device_id: &str) -> Result<Option<DeviceStatus>, IngestError> {
        Ok(self.timed(self.store.get_device(device_id)).await?)
    }

    pub async fn list_devices(&self) -> Result<Vec<DeviceStatus>, IngestError> {
        Ok(self.timed(self.store.list_devices()).await?)
    }

    pub async fn register_device(
        &self,
        device_id: &str,
        registration: &DeviceRegistration,
    ) -> Result<(), IngestError> {
        if device_id.trim().is_empty() {
            return Err(IngestError::Config("device id must not be empty".to_string()));
        }
        self.timed(self.store.register_device(device_id, registration, Utc::now()))
            .await?;
        debug!(device_id = %device_id, "Device registered");
        Ok(())
    }
}
