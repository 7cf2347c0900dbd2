//! Liveness and metrics projections
//!
//! [`HealthReporter`] keeps no state of its own. Every probe re-reads the
//! shared [`ConsumerHealth`] counters and asks the store for its table status.

use crate::health::ConsumerHealth;
use crate::store::{LocationStore, StoreAdapter};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

pub const CONSUMER_COMPONENT: &str = "stream_consumer";
pub const STORE_COMPONENT: &str = "store";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeStatus {
    Healthy,
    Starting,
    Degraded,
    Unhealthy,
}

impl ProbeStatus {
    /// Whether an external supervisor should treat the process as alive
    pub fn is_alive(&self) -> bool {
        !matches!(self, ProbeStatus::Unhealthy)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    Initializing,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LivenessReport {
    pub status: ProbeStatus,
    pub timestamp: DateTime<Utc>,
    pub components: BTreeMap<&'static str, ComponentStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsReport {
    pub records_processed: u64,
    pub error_count: u64,
    pub last_sequence_number: Option<String>,
    pub consumer_lag_ms: Option<i64>,
}

pub struct HealthReporter<S: LocationStore> {
    health: Arc<ConsumerHealth>,
    store: StoreAdapter<S>,
}

impl<S: LocationStore> HealthReporter<S> {
    pub fn new(health: Arc<ConsumerHealth>, store: StoreAdapter<S>) -> Self {
        Self { health, store }
    }

    fn consumer_status(&self, now: DateTime<Utc>) -> ComponentStatus {
        if self.health.start_time().is_none() {
            ComponentStatus::Initializing
        } else if self.health.is_healthy_at(now) {
            ComponentStatus::Healthy
        } else {
            ComponentStatus::Degraded
        }
    }

    pub async fn liveness(&self) -> LivenessReport {
        self.liveness_at(Utc::now()).await
    }

    /// Combined probe: an unhealthy store fails it, a consumer that has not
    /// started reports `Starting`, a stale or stopped consumer `Degraded`.
    pub async fn liveness_at(&self, now: DateTime<Utc>) -> LivenessReport {
        let store = if self.store.health_check().await {
            ComponentStatus::Healthy
        } else {
            ComponentStatus::Unhealthy
        };

        let mut components = BTreeMap::new();
        components.insert(CONSUMER_COMPONENT, self.consumer_status(now));
        components.insert(STORE_COMPONENT, store);

        let status = if components.values().any(|c| *c == ComponentStatus::Unhealthy) {
            ProbeStatus::Unhealthy
        } else if components.values().any(|c| *c == ComponentStatus::Initializing) {
            ProbeStatus::Starting
        } else if components.values().any(|c| *c == ComponentStatus::Degraded) {
            ProbeStatus::Degraded
        } else {
            ProbeStatus::Healthy
        };

        LivenessReport {
            status,
            timestamp: now,
            components,
        }
    }

    pub fn metrics(&self) -> MetricsReport {
        self.metrics_at(Utc::now())
    }

    pub fn metrics_at(&self, now: DateTime<Utc>) -> MetricsReport {
        MetricsReport {
            records_processed: self.health.records_processed(),
            error_count: self.health.error_count(),
            last_sequence_number: self.health.last_sequence_number(),
            consumer_lag_ms: self.health.lag_ms_at(now),
        }
    }
}
