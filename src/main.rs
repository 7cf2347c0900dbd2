use anyhow::Context;
use aws_config::{BehaviorVersion, Region};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trackstore::config::IngestConfig;
use trackstore::monitoring::MetricsAggregator;
use trackstore::reporter::HealthReporter;
use trackstore::server;
use trackstore::store::{DynamoDbLocationStore, StoreAdapter};
use trackstore::StreamConsumer;

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = IngestConfig::from_env().context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&settings.log_level)),
        )
        .init();

    let consumer_config = settings.consumer_config()?;

    let mut loader = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(settings.region.clone()));
    if let Some(endpoint) = &settings.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;

    let kinesis = aws_sdk_kinesis::Client::new(&sdk_config);
    let location_store = DynamoDbLocationStore::builder()
        .with_client(aws_sdk_dynamodb::Client::new(&sdk_config))
        .with_device_table(&settings.device_table_name)
        .with_location_table(&settings.location_table_name)
        .with_location_ttl(settings.location_ttl())
        .build()?;
    let store = StoreAdapter::new(location_store, consumer_config.store.clone());

    let metrics_interval = consumer_config.monitoring.metrics_interval;
    let (consumer, monitoring_rx) = StreamConsumer::new(consumer_config, kinesis, store.clone());
    let consumer = Arc::new(consumer);

    if let Some(rx) = monitoring_rx {
        tokio::spawn(MetricsAggregator::new(metrics_interval, rx).run());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = {
        let consumer = consumer.clone();
        tokio::spawn(async move { consumer.run(shutdown_rx).await })
    };

    let reporter = Arc::new(HealthReporter::new(consumer.health(), store));
    let addr = SocketAddr::from(([0, 0, 0, 0], settings.http_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, stream = %settings.stream_name, "Serving health endpoints");

    axum::serve(listener, server::router(reporter))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("health server failed")?;

    shutdown_tx.send_replace(true);
    consumer_task.await??;
    info!("Shutdown complete");
    Ok(())
}
