use crate::error::{IngestError, StoreError};
use crate::model::{
    Coordinates, DeviceRegistration, DeviceState, DeviceStatus, LocationPayload, LocationRecord,
    StatusUpdate,
};
use crate::store::{LocationQuery, LocationStore};
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::DisplayErrorContext,
    types::{AttributeValue, PutRequest, TableStatus, WriteRequest},
    Client as DynamoClient,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, instrument, trace, warn};

type Item = HashMap<String, AttributeValue>;

const DEFAULT_TTL: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// DynamoDB-backed location and device tables
#[derive(Debug, Clone)]
pub struct DynamoDbLocationStore {
    client: DynamoClient,
    device_table: String,
    location_table: String,
    location_ttl: Duration,
}

impl DynamoDbLocationStore {
    pub fn builder() -> DynamoDbLocationStoreBuilder {
        DynamoDbLocationStoreBuilder::new()
    }

    pub fn location_table(&self) -> &str {
        &self.location_table
    }

    pub fn device_table(&self) -> &str {
        &self.device_table
    }

    async fn table_is_active(&self, table: &str) -> Result<bool, StoreError> {
        let response = self
            .client
            .describe_table()
            .table_name(table)
            .send()
            .await
            .map_err(backend)?;

        let status = response.table().and_then(|t| t.table_status()).cloned();
        trace!(table = %table, status = ?status, "Described table");
        Ok(status == Some(TableStatus::Active))
    }
}

/// Epoch seconds at which a row written at `now` expires
fn expires_at(now: DateTime<Utc>, ttl: Duration) -> Result<i64, StoreError> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|ttl| now.checked_add_signed(ttl))
        .map(|at| at.timestamp())
        .ok_or_else(|| StoreError::InvalidItem(format!("location TTL {ttl:?} overflows the expiry timestamp")))
}

fn backend<E: std::error::Error + 'static>(err: E) -> StoreError {
    StoreError::Backend(DisplayErrorContext(&err).to_string())
}

fn number(value: impl ToString) -> AttributeValue {
    AttributeValue::N(value.to_string())
}

/// Location row in the shape the query side expects
pub(crate) fn location_item(record: &LocationRecord, expires_at: i64) -> Item {
    let mut item = Item::new();
    item.insert("deviceId".into(), AttributeValue::S(record.device_id().to_string()));
    item.insert("timestamp".into(), number(record.timestamp()));
    item.insert("latitude".into(), number(record.latitude()));
    item.insert("longitude".into(), number(record.longitude()));
    item.insert("ttl".into(), number(expires_at));

    if let Some(day) = DateTime::<Utc>::from_timestamp_millis(record.timestamp()) {
        item.insert("date".into(), AttributeValue::S(day.format("%Y-%m-%d").to_string()));
    }
    if let Some(speed) = record.speed() {
        item.insert("speed".into(), number(speed));
    }
    if let Some(heading) = record.heading() {
        item.insert("heading".into(), number(heading));
    }
    if let Some(accuracy) = record.accuracy() {
        item.insert("accuracy".into(), number(accuracy));
    }

    let enrichment = record.enrichment();
    if let Some(processed_at) = enrichment.processed_at {
        item.insert("processedAt".into(), number(processed_at));
    }
    if let Some(region) = &enrichment.region {
        item.insert("region".into(), AttributeValue::S(region.clone()));
    }
    if let Some(quality) = &enrichment.quality_score {
        item.insert("qualityScore".into(), AttributeValue::S(quality.clone()));
    }
    item
}

fn get_s(item: &Item, key: &str) -> Option<String> {
    item.get(key).and_then(|v| v.as_s().ok()).cloned()
}

fn get_n<T: std::str::FromStr>(item: &Item, key: &str) -> Result<Option<T>, StoreError> {
    match item.get(key).and_then(|v| v.as_n().ok()) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| StoreError::InvalidItem(format!("{key} is not a valid number: {raw}"))),
        None => Ok(None),
    }
}

fn require<T>(value: Option<T>, key: &str) -> Result<T, StoreError> {
    value.ok_or_else(|| StoreError::InvalidItem(format!("missing {key}")))
}

pub(crate) fn item_to_location(item: &Item) -> Result<LocationRecord, StoreError> {
    let payload = LocationPayload {
        bus_id: require(get_s(item, "deviceId"), "deviceId")?,
        lat: require(get_n(item, "latitude")?, "latitude")?,
        lon: require(get_n(item, "longitude")?, "longitude")?,
        ts: require(get_n(item, "timestamp")?, "timestamp")?,
        speed: get_n(item, "speed")?,
        heading: get_n(item, "heading")?,
        accuracy: get_n(item, "accuracy")?,
        processed_at: get_n(item, "processedAt")?,
        region: get_s(item, "region"),
        quality_score: get_s(item, "qualityScore"),
    };
    LocationRecord::try_from(payload).map_err(|e| StoreError::InvalidItem(e.to_string()))
}

pub(crate) fn item_to_device(item: &Item) -> Result<DeviceStatus, StoreError> {
    let last_location = match item.get("lastLocation").and_then(|v| v.as_m().ok()) {
        Some(loc) => Some(Coordinates {
            lat: get_n(loc, "lat")?.unwrap_or_default(),
            lon: get_n(loc, "lon")?.unwrap_or_default(),
        }),
        None => None,
    };

    let attributes = match item.get("attributes").and_then(|v| v.as_m().ok()) {
        Some(map) => map
            .iter()
            .map(|(k, v)| (k.clone(), attribute_to_json(v)))
            .collect(),
        None => HashMap::new(),
    };

    Ok(DeviceStatus {
        device_id: require(get_s(item, "deviceId"), "deviceId")?,
        last_seen: get_n(item, "lastSeen")?,
        last_location,
        status: get_s(item, "status")
            .map(|s| DeviceState::parse(&s))
            .unwrap_or_default(),
        registered_at: get_n(item, "registeredAt")?.unwrap_or_default(),
        total_updates: get_n(item, "totalUpdates")?.unwrap_or_default(),
        attributes,
    })
}

pub(crate) fn json_to_attribute(value: &serde_json::Value) -> AttributeValue {
    use serde_json::Value;
    match value {
        Value::Null => AttributeValue::Null(true),
        Value::Bool(b) => AttributeValue::Bool(*b),
        Value::Number(n) => AttributeValue::N(n.to_string()),
        Value::String(s) => AttributeValue::S(s.clone()),
        Value::Array(items) => AttributeValue::L(items.iter().map(json_to_attribute).collect()),
        Value::Object(map) => AttributeValue::M(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_attribute(v)))
                .collect(),
        ),
    }
}

pub(crate) fn attribute_to_json(value: &AttributeValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::N(n) => n
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| n.parse::<f64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(n.clone())),
        AttributeValue::L(items) => Value::Array(items.iter().map(attribute_to_json).collect()),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), attribute_to_json(v)))
                .collect(),
        ),
        AttributeValue::Ss(items) => Value::from(items.clone()),
        _ => Value::Null,
    }
}

#[async_trait]
impl LocationStore for DynamoDbLocationStore {
    #[instrument(skip(self, chunk), fields(table = %self.location_table, count = chunk.len()))]
    async fn put_locations(&self, chunk: &[LocationRecord]) -> Result<(), StoreError> {
        let expires_at = expires_at(Utc::now(), self.location_ttl)?;

        // BatchWriteItem rejects a request that names the same key twice
        let mut unique: HashMap<(&str, i64), &LocationRecord> = HashMap::new();
        for record in chunk {
            unique.insert((record.device_id(), record.timestamp()), record);
        }

        let requests = unique
            .values()
            .map(|record| {
                PutRequest::builder()
                    .set_item(Some(location_item(record, expires_at)))
                    .build()
                    .map(|put| WriteRequest::builder().put_request(put).build())
                    .map_err(|e| StoreError::InvalidItem(e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let response = self
            .client
            .batch_write_item()
            .request_items(&self.location_table, requests)
            .send()
            .await
            .map_err(backend)?;

        let unprocessed = response
            .unprocessed_items()
            .and_then(|items| items.get(&self.location_table))
            .map_or(0, Vec::len);
        if unprocessed > 0 {
            warn!(unprocessed = unprocessed, "Batch write left items unprocessed");
            return Err(StoreError::Unprocessed(unprocessed));
        }

        trace!(count = unique.len(), "Chunk written to DynamoDB");
        Ok(())
    }

    async fn upsert_status(&self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<(), StoreError> {
        let location = HashMap::from([
            ("lat".to_string(), number(update.last_location.lat)),
            ("lon".to_string(), number(update.last_location.lon)),
        ]);

        self.client
            .update_item()
            .table_name(&self.device_table)
            .key("deviceId", AttributeValue::S(update.device_id.clone()))
            .update_expression(
                "SET lastSeen = :ts, lastLocation = :loc, #status = :status, \
                 totalUpdates = if_not_exists(totalUpdates, :zero) + :one, \
                 registeredAt = if_not_exists(registeredAt, :now)",
            )
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":ts", number(update.last_seen))
            .expression_attribute_values(":loc", AttributeValue::M(location))
            .expression_attribute_values(":status", AttributeValue::S(DeviceState::Active.as_str().into()))
            .expression_attribute_values(":zero", number(0))
            .expression_attribute_values(":one", number(1))
            .expression_attribute_values(":now", number(now.timestamp_millis()))
            .send()
            .await
            .map_err(backend)?;

        trace!(device_id = %update.device_id, "Device status updated");
        Ok(())
    }

    async fn tables_active(&self) -> Result<bool, StoreError> {
        let devices = self.table_is_active(&self.device_table).await?;
        let locations = self.table_is_active(&self.location_table).await?;
        Ok(devices && locations)
    }

    #[instrument(skip(self), fields(table = %self.location_table))]
    async fn query_locations(&self, query: &LocationQuery) -> Result<Vec<LocationRecord>, StoreError> {
        let mut request = self
            .client
            .query()
            .table_name(&self.location_table)
            .expression_attribute_values(":device", AttributeValue::S(query.device_id.clone()))
            .scan_index_forward(false)
            .limit(i32::try_from(query.limit).unwrap_or(i32::MAX));

        // `timestamp` is a reserved word; the alias is only declared when used
        let range = match (query.start_time, query.end_time) {
            (Some(start), Some(end)) => {
                request = request
                    .expression_attribute_values(":start", number(start))
                    .expression_attribute_values(":end", number(end));
                Some("#ts BETWEEN :start AND :end")
            }
            (Some(start), None) => {
                request = request.expression_attribute_values(":start", number(start));
                Some("#ts >= :start")
            }
            (None, Some(end)) => {
                request = request.expression_attribute_values(":end", number(end));
                Some("#ts <= :end")
            }
            (None, None) => None,
        };

        request = match range {
            Some(condition) => request
                .key_condition_expression(format!("deviceId = :device AND {condition}"))
                .expression_attribute_names("#ts", "timestamp"),
            None => request.key_condition_expression("deviceId = :device"),
        };

        let response = request.send().await.map_err(backend)?;
        let records = response
            .items()
            .iter()
            .map(item_to_location)
            .collect::<Result<Vec<_>, _>>()?;

        debug!(device_id = %query.device_id, count = records.len(), "Queried locations");
        Ok(records)
    }

    async fn get_device(&self, device_id: &str) -> Result<Option<DeviceStatus>, StoreError> {
        let response = self
            .client
            .get_item()
            .table_name(&self.device_table)
            .key("deviceId", AttributeValue::S(device_id.to_string()))
            .send()
            .await
            .map_err(backend)?;

        response.item().map(item_to_device).transpose()
    }

    async fn list_devices(&self) -> Result<Vec<DeviceStatus>, StoreError> {
        let mut devices = Vec::new();
        let mut start_key: Option<Item> = None;

        loop {
            let response = self
                .client
                .scan()
                .table_name(&self.device_table)
                .set_exclusive_start_key(start_key.take())
                .send()
                .await
                .map_err(backend)?;

            for item in response.items() {
                devices.push(item_to_device(item)?);
            }

            match response.last_evaluated_key() {
                Some(key) if !key.is_empty() => start_key = Some(key.clone()),
                _ => break,
            }
        }

        Ok(devices)
    }

    async fn register_device(
        &self,
        device_id: &str,
        registration: &DeviceRegistration,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let attributes = registration
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), json_to_attribute(v)))
            .collect();

        self.client
            .update_item()
            .table_name(&self.device_table)
            .key("deviceId", AttributeValue::S(device_id.to_string()))
            .update_expression(
                "SET registeredAt = if_not_exists(registeredAt, :now), \
                 #status = if_not_exists(#status, :inactive), attributes = :attrs",
            )
            .expression_attribute_names("#status", "status")
            .expression_attribute_values(":now", number(now.timestamp_millis()))
            .expression_attribute_values(
                ":inactive",
                AttributeValue::S(DeviceState::Inactive.as_str().into()),
            )
            .expression_attribute_values(":attrs", AttributeValue::M(attributes))
            .send()
            .await
            .map_err(backend)?;

        Ok(())
    }
}

#[derive(Debug)]
pub struct DynamoDbLocationStoreBuilder {
    client: Option<DynamoClient>,
    device_table: Option<String>,
    location_table: Option<String>,
    location_ttl: Duration,
}

impl Default for DynamoDbLocationStoreBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamoDbLocationStoreBuilder {
    pub fn new() -> Self {
        Self {
            client: None,
            device_table: None,
            location_table: None,
            location_ttl: DEFAULT_TTL,
        }
    }

    pub fn with_client(mut self, client: DynamoClient) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_device_table(mut self, table: impl Into<String>) -> Self {
        self.device_table = Some(table.into());
        self
    }

    pub fn with_location_table(mut self, table: impl Into<String>) -> Self {
        self.location_table = Some(table.into());
        self
    }

    pub fn with_location_ttl(mut self, ttl: Duration) -> Self {
        self.location_ttl = ttl;
        self
    }

    pub fn build(self) -> Result<DynamoDbLocationStore, IngestError> {
        Ok(DynamoDbLocationStore {
            client: self
                .client
                .ok_or_else(|| IngestError::Config("DynamoDB client is required".into()))?,
            device_table: self
                .device_table
                .ok_or_else(|| IngestError::Config("Device table name is required".into()))?,
            location_table: self
                .location_table
                .ok_or_else(|| IngestError::Config("Location table name is required".into()))?,
            location_ttl: self.location_ttl,
        })
    }
}
