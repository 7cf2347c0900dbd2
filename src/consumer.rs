//! Stream consumer
//!
//! Discovers partitions, runs one [`PartitionCursor`] per partition and
//! reconciles the running set against the stream on a fixed cadence. No
//! failure of a single partition ends [`StreamConsumer::run`]; it returns only
//! after a stop signal, once every cursor has finished.

use crate::client::{StartingPosition, StreamClient};
use crate::cursor::{CursorContext, CursorExit, CursorOutcome, PartitionCursor};
use crate::error::Result;
use crate::health::{ConsumerHealth, HealthWindows};
use crate::monitoring::{IngestEvent, MonitoringConfig};
use crate::retry::{Backoff, ExponentialBackoff, FixedBackoff};
use crate::store::{LocationStore, StoreAdapter, StoreConfig};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffStrategy {
    /// Same delay after every failure
    #[default]
    Fixed,
    /// Jittered exponential growth from the configured delay
    Exponential,
}

/// Runtime settings for the consumer and its cursors
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub stream_name: String,
    /// Maximum records per fetch
    pub batch_size: i32,
    /// Sleep after an empty fetch
    pub poll_interval: Duration,
    /// Delay before reacquiring an iterator after a fetch failure
    pub backoff_delay: Duration,
    pub backoff_strategy: BackoffStrategy,
    /// Bound on every stream call
    pub api_timeout: Duration,
    pub starting_position: StartingPosition,
    /// Re-list cadence while the stream has no partitions
    pub idle_wait: Duration,
    /// Re-list cadence while partitions exist
    pub partition_refresh: Duration,
    /// Start a new cursor for a partition whose cursor failed
    pub restart_terminated: bool,
    pub health: HealthWindows,
    pub store: StoreConfig,
    pub monitoring: MonitoringConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            stream_name: String::new(),
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            backoff_delay: Duration::from_secs(5),
            backoff_strategy: BackoffStrategy::Fixed,
            api_timeout: Duration::from_secs(10),
            starting_position: StartingPosition::Latest,
            idle_wait: Duration::from_secs(30),
            partition_refresh: Duration::from_secs(60),
            restart_terminated: false,
            health: HealthWindows::default(),
            store: StoreConfig::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn backoff(&self) -> Arc<dyn Backoff> {
        match self.backoff_strategy {
            BackoffStrategy::Fixed => Arc::new(FixedBackoff::new(self.backoff_delay)),
            BackoffStrategy::Exponential => Arc::new(
                ExponentialBackoff::builder()
                    .initial_delay(self.backoff_delay)
                    .max_delay(self.backoff_delay * 12)
                    .jitter_factor(0.1)
                    .build(),
            ),
        }
    }
}

struct RunningCursor {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<CursorOutcome>,
    generation: u64,
}

/// Supervisor bookkeeping, owned by [`StreamConsumer::run`]
struct Supervisor {
    running: HashMap<String, RunningCursor>,
    /// Cursors asked to stop because their partition disappeared
    retiring: Vec<(String, JoinHandle<CursorOutcome>)>,
    /// How each finished partition ended
    finished: HashMap<String, CursorExit>,
    /// Cursor tasks report `(partition_id, generation)` here as they finish
    exited_tx: mpsc::UnboundedSender<(String, u64)>,
    spawned: u64,
}

impl Supervisor {
    fn new(exited_tx: mpsc::UnboundedSender<(String, u64)>) -> Self {
        Self {
            running: HashMap::new(),
            retiring: Vec::new(),
            finished: HashMap::new(),
            exited_tx,
            spawned: 0,
        }
    }
}

pub struct StreamConsumer<C, S: LocationStore> {
    ctx: CursorContext<C, S>,
    stop_tx: watch::Sender<bool>,
}

impl<C, S> StreamConsumer<C, S>
where
    C: StreamClient + 'static,
    S: LocationStore + 'static,
{
    /// Create a consumer; the receiver is `Some` when monitoring is enabled
    pub fn new(
        config: ConsumerConfig,
        client: C,
        store: StoreAdapter<S>,
    ) -> (Self, Option<mpsc::Receiver<IngestEvent>>) {
        let (monitoring_tx, monitoring_rx) = if config.monitoring.enabled {
            let (tx, rx) = mpsc::channel(config.monitoring.channel_size);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let ctx = CursorContext {
            client: Arc::new(client),
            store,
            health: Arc::new(ConsumerHealth::new(config.health)),
            backoff: config.backoff(),
            config: Arc::new(config),
            monitoring_tx,
        };
        let (stop_tx, _) = watch::channel(false);

        (Self { ctx, stop_tx }, monitoring_rx)
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.ctx.config
    }

    pub fn health(&self) -> Arc<ConsumerHealth> {
        self.ctx.health.clone()
    }

    pub fn store(&self) -> &StoreAdapter<S> {
        &self.ctx.store
    }

    pub fn is_healthy(&self) -> bool {
        self.ctx.health.is_healthy_at(Utc::now())
    }

    pub fn lag_ms(&self) -> Option<i64> {
        self.ctx.health.lag_ms_at(Utc::now())
    }

    /// Ask a running [`run`](Self::run) to shut down
    pub fn stop(&self) {
        info!("Stopping stream consumer");
        self.stop_tx.send_replace(true);
    }

    /// Consume the stream until `shutdown` flips to true or [`stop`](Self::stop) is called
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let config = self.ctx.config.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let (exited_tx, mut exited_rx) = mpsc::unbounded_channel();
        let mut supervisor = Supervisor::new(exited_tx);

        self.ctx.health.mark_started(Utc::now());
        info!(
            stream = %config.stream_name,
            position = ?config.starting_position,
            "Starting stream consumer"
        );

        'supervise: loop {
            if *shutdown.borrow() || *stop_rx.borrow() {
                break;
            }

            self.reconcile(&mut supervisor).await;

            let wait = if supervisor.running.is_empty() {
                info!(wait_secs = config.idle_wait.as_secs(), "No active partitions, waiting");
                config.idle_wait
            } else {
                config.partition_refresh
            };

            let deadline = tokio::time::Instant::now() + wait;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            info!("Shutdown channel closed");
                            break 'supervise;
                        }
                        break;
                    }
                    _ = stop_rx.changed() => break,
                    Some((partition_id, generation)) = exited_rx.recv() => {
                        self.cursor_exited(&mut supervisor, partition_id, generation).await;
                    }
                }
            }
        }

        self.shutdown(supervisor).await;
        self.ctx.health.mark_stopped();
        info!("Stream consumer shutdown complete");
        Ok(())
    }

    fn spawn_cursor(&self, partition_id: &str, supervisor: &mut Supervisor) -> RunningCursor {
        let (stop_tx, stop_rx) = watch::channel(false);
        let cursor = PartitionCursor::new(self.ctx.clone(), partition_id, stop_rx);
        supervisor.spawned += 1;
        let generation = supervisor.spawned;
        let exited_tx = supervisor.exited_tx.clone();
        let id = partition_id.to_string();
        RunningCursor {
            stop_tx,
            handle: tokio::spawn(async move {
                let outcome = cursor.run().await;
                let _ = exited_tx.send((id, generation));
                outcome
            }),
            generation,
        }
    }

    /// Settle a cursor that reported its own exit and publish the new active count
    async fn cursor_exited(&self, supervisor: &mut Supervisor, partition_id: String, generation: u64) {
        let current = supervisor
            .running
            .get(&partition_id)
            .is_some_and(|cursor| cursor.generation == generation);
        if current {
            if let Some(cursor) = supervisor.running.remove(&partition_id) {
                self.settle(supervisor, partition_id, cursor.handle).await;
            }
        }
        supervisor.retiring.retain(|(_, handle)| !handle.is_finished());
        self.ctx.health.set_active_partitions(supervisor.running.len());
    }

    async fn reap(&self, supervisor: &mut Supervisor) {
        let done: Vec<String> = supervisor
            .running
            .iter()
            .filter(|(_, cursor)| cursor.handle.is_finished())
            .map(|(id, _)| id.clone())
            .collect();

        for partition_id in done {
            if let Some(cursor) = supervisor.running.remove(&partition_id) {
                self.settle(supervisor, partition_id, cursor.handle).await;
            }
        }

        supervisor.retiring.retain(|(_, handle)| !handle.is_finished());
    }

    async fn settle(
        &self,
        supervisor: &mut Supervisor,
        partition_id: String,
        handle: JoinHandle<CursorOutcome>,
    ) {
        match handle.await {
            Ok(outcome) => {
                if outcome.exit.is_failure() {
                    warn!(
                        partition_id = %partition_id,
                        exit = ?outcome.exit,
                        "Partition cursor terminated"
                    );
                }
                supervisor.finished.insert(partition_id, outcome.exit);
            }
            Err(e) => {
                error!(partition_id = %partition_id, error = %e, "Partition cursor task failed");
                supervisor
                    .finished
                    .insert(partition_id, CursorExit::ReacquireFailed);
            }
        }
    }

    fn should_start(&self, partition_id: &str, supervisor: &Supervisor) -> bool {
        if supervisor.running.contains_key(partition_id) {
            return false;
        }
        match supervisor.finished.get(partition_id) {
            None | Some(CursorExit::Stopped) => true,
            Some(CursorExit::PartitionClosed) => false,
            Some(_) => self.ctx.config.restart_terminated,
        }
    }

    /// Re-list partitions, start cursors for new ones and retire removed ones
    async fn reconcile(&self, supervisor: &mut Supervisor) {
        self.reap(supervisor).await;

        let config = &self.ctx.config;
        let listed = tokio::time::timeout(
            config.api_timeout,
            self.ctx.client.list_partitions(&config.stream_name),
        )
        .await;

        let partitions = match listed {
            Ok(Ok(partitions)) => partitions,
            Ok(Err(e)) if e.is_permission_or_config() => {
                error!(
                    stream = %config.stream_name,
                    error = %e,
                    hint = e.hint().unwrap_or("none"),
                    "Permission or configuration failure listing partitions"
                );
                return;
            }
            Ok(Err(e)) => {
                warn!(
                    stream = %config.stream_name,
                    error = %e,
                    "Failed to list partitions, retrying on next refresh"
                );
                return;
            }
            Err(_) => {
                warn!(
                    stream = %config.stream_name,
                    timeout_secs = config.api_timeout.as_secs(),
                    "Listing partitions timed out"
                );
                return;
            }
        };

        let current: HashSet<&str> = partitions.iter().map(String::as_str).collect();

        let removed: Vec<String> = supervisor
            .running
            .keys()
            .filter(|id| !current.contains(id.as_str()))
            .cloned()
            .collect();
        for partition_id in removed {
            if let Some(cursor) = supervisor.running.remove(&partition_id) {
                info!(partition_id = %partition_id, "Partition no longer listed, retiring cursor");
                cursor.stop_tx.send_replace(true);
                supervisor.retiring.push((partition_id, cursor.handle));
            }
        }
        supervisor
            .finished
            .retain(|id, _| current.contains(id.as_str()));

        for partition_id in &partitions {
            if !self.should_start(partition_id, supervisor) {
                continue;
            }
            if supervisor.finished.remove(partition_id.as_str()).is_some() {
                info!(partition_id = %partition_id, "Restarting partition cursor");
            }
            let cursor = self.spawn_cursor(partition_id, supervisor);
            supervisor.running.insert(partition_id.clone(), cursor);
        }

        self.ctx.health.set_active_partitions(supervisor.running.len());
        debug!(
            listed = partitions.len(),
            running = supervisor.running.len(),
            finished = supervisor.finished.len(),
            "Partitions reconciled"
        );
    }

    async fn shutdown(&self, supervisor: Supervisor) {
        let mut handles = Vec::with_capacity(supervisor.running.len() + supervisor.retiring.len());
        for (partition_id, cursor) in supervisor.running {
            cursor.stop_tx.send_replace(true);
            handles.push((partition_id, cursor.handle));
        }
        handles.extend(supervisor.retiring);

        info!(cursors = handles.len(), "Waiting for partition cursors to stop");
        let (ids, handles): (Vec<_>, Vec<_>) = handles.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        for (partition_id, result) in ids.into_iter().zip(results) {
            match result {
                Ok(outcome) => debug!(
                    partition_id = %partition_id,
                    exit = ?outcome.exit,
                    last_sequence = ?outcome.state.last_sequence_number,
                    "Cursor stopped"
                ),
                Err(e) => error!(partition_id = %partition_id, error = %e, "Cursor task failed"),
            }
        }
        self.ctx.health.set_active_partitions(0);
    }
}
