use crate::consumer::{ConsumerConfig, StreamConsumer};
use crate::error::Result;
use crate::monitoring::{IngestEvent, MonitoringConfig};
use crate::store::{StoreAdapter, StoreConfig};
use crate::test::init_logging;
use crate::test::mocks::{MockLocationStore, MockStreamClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub type TestConsumer = StreamConsumer<MockStreamClient, MockLocationStore>;

pub fn create_test_config() -> ConsumerConfig {
    ConsumerConfig {
        stream_name: "test-stream".to_string(),
        poll_interval: Duration::from_millis(200),
        backoff_delay: Duration::from_secs(1),
        api_timeout: Duration::from_secs(1),
        ..Default::default()
    }
}

pub struct TestContext {
    pub client: MockStreamClient,
    pub store: MockLocationStore,
    pub consumer: Arc<TestConsumer>,
    pub monitoring_rx: Option<mpsc::Receiver<IngestEvent>>,
}

impl TestContext {
    pub fn new(config: ConsumerConfig) -> Self {
        init_logging();
        let client = MockStreamClient::new();
        let store = MockLocationStore::new();
        let (consumer, monitoring_rx) = StreamConsumer::new(
            config,
            client.clone(),
            StoreAdapter::new(store.clone(), StoreConfig::default()),
        );
        Self {
            client,
            store,
            consumer: Arc::new(consumer),
            monitoring_rx,
        }
    }

    pub fn with_monitoring() -> Self {
        Self::new(ConsumerConfig {
            monitoring: MonitoringConfig {
                enabled: true,
                ..Default::default()
            },
            ..create_test_config()
        })
    }

    pub fn start(&self) -> (watch::Sender<bool>, JoinHandle<Result<()>>) {
        let (tx, rx) = watch::channel(false);
        let consumer = self.consumer.clone();
        (tx, tokio::spawn(async move { consumer.run(rx).await }))
    }
}
