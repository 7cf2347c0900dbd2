//! Trackstore - Kinesis-to-DynamoDB ingestion for vehicle locations
//!
//! Consumes every partition of a location stream, validates each record and
//! persists it twice: as a row in the location history table and as the
//! latest position on the device status table. Health and lag are exposed
//! through [`reporter::HealthReporter`] and the HTTP probes in [`server`].

pub mod client;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod error;
pub mod health;
pub mod model;
pub mod monitoring;
pub mod reporter;
pub mod retry;
pub mod server;
pub mod store;

// Make test utilities available for integration tests
#[cfg(any(test, feature = "test-utils"))]
pub mod test;

#[cfg(test)]
mod tests;

pub use client::{RecordBatch, StartingPosition, StreamClient, StreamRecord};
pub use consumer::{BackoffStrategy, ConsumerConfig, StreamConsumer};
pub use error::{IngestError, Result};
pub use health::{ConsumerHealth, HealthWindows};
pub use model::{DeviceStatus, LocationPayload, LocationRecord};
pub use retry::{Backoff, ExponentialBackoff};

// Re-export the storage seam and its implementations
pub use store::{DynamoDbLocationStore, InMemoryLocationStore, LocationStore, StoreAdapter};
