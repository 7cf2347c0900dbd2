use super::common::{create_test_config, TestContext};
use crate::client::StartingPosition;
use crate::consumer::ConsumerConfig;
use crate::error::StreamClientError;
use crate::model::{Coordinates, DeviceState};
use crate::reporter::{HealthReporter, ProbeStatus};
use crate::test::TestUtils;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::sleep;

#[tokio::test(start_paused = true)]
async fn test_two_locations_for_one_bus() {
    let ctx = TestContext::new(create_test_config());
    ctx.client.set_partitions(&["shard-0"]).await;
    ctx.client
        .mock_get_records(
            "shard-0",
            Ok(TestUtils::batch(vec![
                TestUtils::location_record("1", "bus-1", 43.47, -80.54, 1000),
                TestUtils::location_record("2", "bus-1", 43.48, -80.55, 2000),
            ])),
        )
        .await;

    let (tx, handle) = ctx.start();
    sleep(Duration::from_secs(2)).await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let store = ctx.consumer.store();
    let history = store.query_locations("bus-1", None, None, 10).await.unwrap();
    assert_eq!(
        history.iter().map(|r| r.timestamp()).collect::<Vec<_>>(),
        vec![2000, 1000]
    );

    let status = store.device_status("bus-1").await.unwrap().unwrap();
    assert_eq!(status.last_seen, Some(2000));
    assert_eq!(status.last_location, Some(Coordinates { lat: 43.48, lon: -80.55 }));
    assert_eq!(status.total_updates, 2);
    assert_eq!(status.status, DeviceState::Active);

    let health = ctx.consumer.health();
    assert_eq!(health.records_processed(), 2);
    assert_eq!(health.error_count(), 0);
    assert_eq!(health.last_sequence_number().as_deref(), Some("2"));
    assert!(!health.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_partitions_are_isolated_and_malformed_records_skipped() {
    let ctx = TestContext::new(create_test_config());
    ctx.client.set_partitions(&["shard-0", "shard-1"]).await;
    ctx.client
        .mock_get_records(
            "shard-0",
            Ok(TestUtils::batch(vec![
                TestUtils::location_record("10", "bus-1", 43.47, -80.54, 1000),
                TestUtils::stream_record("11", b"not a location"),
            ])),
        )
        .await;
    ctx.client
        .mock_get_records("shard-1", Err(StreamClientError::Throttled))
        .await;
    ctx.client
        .mock_get_records(
            "shard-1",
            Ok(TestUtils::batch(vec![TestUtils::location_record(
                "20", "bus-2", 1.5, 2.5, 3000,
            )])),
        )
        .await;

    let (tx, handle) = ctx.start();
    sleep(Duration::from_secs(3)).await;

    let reporter = HealthReporter::new(ctx.consumer.health(), ctx.consumer.store().clone());
    let metrics = reporter.metrics();
    assert_eq!(metrics.records_processed, 2);
    // one malformed record and one throttled fetch
    assert_eq!(metrics.error_count, 2);
    assert_eq!(reporter.liveness().await.status, ProbeStatus::Healthy);

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    let store = ctx.consumer.store();
    assert!(store.device_status("bus-1").await.unwrap().is_some());
    let latest = store.latest_location("bus-2").await.unwrap().unwrap();
    assert_eq!(latest.timestamp(), 3000);
    assert_eq!(ctx.store.inner().location_count().await, 2);

    let devices = store.list_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reacquired_iterator_resumes_after_last_sequence() {
    let ctx = TestContext::new(ConsumerConfig {
        starting_position: StartingPosition::AfterSequenceNumber("5".to_string()),
        ..create_test_config()
    });
    ctx.client.set_partitions(&["shard-0"]).await;
    ctx.client
        .mock_get_records(
            "shard-0",
            Ok(TestUtils::batch(vec![TestUtils::location_record(
                "42", "bus-7", 10.0, 20.0, 500,
            )])),
        )
        .await;
    ctx.client
        .mock_get_records("shard-0", Err(StreamClientError::ExpiredIterator))
        .await;

    let (tx, handle) = ctx.start();
    sleep(Duration::from_secs(3)).await;
    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();

    assert_eq!(
        ctx.client.iterator_requests().await,
        vec![
            (
                "shard-0".to_string(),
                StartingPosition::AfterSequenceNumber("5".to_string())
            ),
            (
                "shard-0".to_string(),
                StartingPosition::AfterSequenceNumber("42".to_string())
            ),
        ]
    );
    assert_eq!(ctx.consumer.health().records_processed(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_fails_liveness_but_not_consumer() {
    let ctx = TestContext::new(create_test_config());
    ctx.client.set_partitions(&["shard-0"]).await;
    ctx.store.fail_next_puts(10).await;
    ctx.client
        .mock_get_records(
            "shard-0",
            Ok(TestUtils::batch(vec![TestUtils::location_record(
                "1", "bus-1", 43.47, -80.54, 1000,
            )])),
        )
        .await;

    let (tx, handle) = ctx.start();
    sleep(Duration::from_secs(10)).await;

    let health = ctx.consumer.health();
    assert!(health.is_running());
    assert_eq!(health.records_processed(), 0);
    assert_eq!(health.error_count(), 1);

    ctx.store.set_tables_active(false);
    let reporter = HealthReporter::new(health.clone(), ctx.consumer.store().clone());
    let report = reporter.liveness().await;
    assert_eq!(report.status, ProbeStatus::Unhealthy);

    tx.send(true).unwrap();
    handle.await.unwrap().unwrap();
    assert_eq!(ctx.store.inner().location_count().await, 0);
}
