//! Domain types for location observations and per-device status
//!
//! Raw stream payloads are deserialized into [`LocationPayload`] and validated
//! exactly once into an immutable [`LocationRecord`]. Nothing past the decode
//! boundary sees untyped JSON.

use crate::error::DecodeError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Wire shape of a location message on the stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPayload {
    #[serde(rename = "busId")]
    pub bus_id: String,
    pub lat: f64,
    pub lon: f64,
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<String>,
}

impl LocationPayload {
    pub fn new(bus_id: impl Into<String>, lat: f64, lon: f64, ts: i64) -> Self {
        Self {
            bus_id: bus_id.into(),
            lat,
            lon,
            ts,
            speed: None,
            heading: None,
            accuracy: None,
            processed_at: None,
            region: None,
            quality_score: None,
        }
    }
}

/// Fields added by the upstream validator; carried through untouched
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub processed_at: Option<i64>,
    pub region: Option<String>,
    pub quality_score: Option<String>,
}

impl Enrichment {
    pub fn is_empty(&self) -> bool {
        self.processed_at.is_none() && self.region.is_none() && self.quality_score.is_none()
    }
}

/// One validated GPS observation
#[derive(Debug, Clone, PartialEq)]
pub struct LocationRecord {
    device_id: String,
    latitude: f64,
    longitude: f64,
    timestamp: i64,
    speed: Option<f64>,
    heading: Option<f64>,
    accuracy: Option<f64>,
    enrichment: Enrichment,
}

impl LocationRecord {
    /// Decode and validate a raw stream payload
    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(data)?;
        let payload: LocationPayload = serde_json::from_str(text)?;
        Self::try_from(payload)
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates {
            lat: self.latitude,
            lon: self.longitude,
        }
    }

    /// Epoch milliseconds
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn speed(&self) -> Option<f64> {
        self.speed
    }

    /// Degrees clockwise from north, in `[0, 360)`
    pub fn heading(&self) -> Option<f64> {
        self.heading
    }

    pub fn accuracy(&self) -> Option<f64> {
        self.accuracy
    }

    pub fn enrichment(&self) -> &Enrichment {
        &self.enrichment
    }

    /// Back to the wire shape
    pub fn to_payload(&self) -> LocationPayload {
        LocationPayload {
            bus_id: self.device_id.clone(),
            lat: self.latitude,
            lon: self.longitude,
            ts: self.timestamp,
            speed: self.speed,
            heading: self.heading,
            accuracy: self.accuracy,
            processed_at: self.enrichment.processed_at,
            region: self.enrichment.region.clone(),
            quality_score: self.enrichment.quality_score.clone(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        Ok(serde_json::to_vec(&self.to_payload())?)
    }
}

impl TryFrom<LocationPayload> for LocationRecord {
    type Error = DecodeError;

    fn try_from(p: LocationPayload) -> Result<Self, Self::Error> {
        if p.bus_id.trim().is_empty() {
            return Err(DecodeError::invalid("busId", "must not be empty"));
        }
        if !p.lat.is_finite() || !(-90.0..=90.0).contains(&p.lat) {
            return Err(DecodeError::invalid("lat", format!("{} outside [-90, 90]", p.lat)));
        }
        if !p.lon.is_finite() || !(-180.0..=180.0).contains(&p.lon) {
            return Err(DecodeError::invalid("lon", format!("{} outside [-180, 180]", p.lon)));
        }
        if let Some(speed) = p.speed {
            if !speed.is_finite() || speed < 0.0 {
                return Err(DecodeError::invalid("speed", format!("{speed} is negative")));
            }
        }
        if let Some(heading) = p.heading {
            if !heading.is_finite() || !(0.0..360.0).contains(&heading) {
                return Err(DecodeError::invalid("heading", format!("{heading} outside [0, 360)")));
            }
        }
        if let Some(accuracy) = p.accuracy {
            if !accuracy.is_finite() || accuracy < 0.0 {
                return Err(DecodeError::invalid("accuracy", format!("{accuracy} is negative")));
            }
        }

        Ok(Self {
            device_id: p.bus_id,
            latitude: p.lat,
            longitude: p.lon,
            timestamp: p.ts,
            speed: p.speed,
            heading: p.heading,
            accuracy: p.accuracy,
            enrichment: Enrichment {
                processed_at: p.processed_at,
                region: p.region,
                quality_score: p.quality_score,
            },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Active,
    Inactive,
    #[default]
    Unknown,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Active => "active",
            DeviceState::Inactive => "inactive",
            DeviceState::Unknown => "unknown",
        }
    }

    /// Unrecognized values read back from the store map to `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => DeviceState::Active,
            "inactive" => DeviceState::Inactive,
            _ => DeviceState::Unknown,
        }
    }
}

/// Per-device rollup row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device_id: String,
    pub last_seen: Option<i64>,
    pub last_location: Option<Coordinates>,
    pub status: DeviceState,
    pub registered_at: i64,
    pub total_updates: u64,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

impl DeviceStatus {
    pub fn registered(device_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            device_id: device_id.into(),
            last_seen: None,
            last_location: None,
            status: DeviceState::Inactive,
            registered_at: now.timestamp_millis(),
            total_updates: 0,
            attributes: HashMap::new(),
        }
    }
}

/// Status change derived from one stored location
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub device_id: String,
    pub last_seen: i64,
    pub last_location: Coordinates,
}

/// Request to create or annotate a device row
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub attributes: HashMap<String, serde_json::Value>,
}
