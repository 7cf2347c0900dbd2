//! Partition cursor
//!
//! One [`PartitionCursor`] owns one partition's iterator and walks the state
//! machine `Init -> Polling -> (Backoff -> Polling)* -> Stopped`. The stop
//! flag is checked at the top of every iteration; sleeps also wake on it, but
//! an in-flight stream or store call always completes (bounded by its timeout).

use crate::client::{RecordBatch, StartingPosition, StreamClient, StreamRecord};
use crate::consumer::ConsumerConfig;
use crate::error::StreamClientError;
use crate::health::ConsumerHealth;
use crate::model::LocationRecord;
use crate::monitoring::{IngestEvent, IteratorEventType, PartitionEventType};
use crate::retry::Backoff;
use crate::store::{LocationStore, StoreAdapter};
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorPhase {
    Init,
    Polling,
    Backoff,
    Stopped,
}

/// Why a cursor task ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorExit {
    /// Stop signal observed
    Stopped,
    /// The first iterator could not be acquired
    InitFailed,
    /// Iterator reacquisition after a backoff failed
    ReacquireFailed,
    /// The partition was closed and fully read
    PartitionClosed,
}

impl CursorExit {
    /// True for exits caused by a stream failure rather than by the stream or the consumer
    pub fn is_failure(&self) -> bool {
        matches!(self, CursorExit::InitFailed | CursorExit::ReacquireFailed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionCursorState {
    pub partition_id: String,
    /// Opaque position token, replaced after every fetch
    pub iterator_token: Option<String>,
    /// Last sequence number read from the partition
    pub last_sequence_number: Option<String>,
    pub consecutive_error_count: u32,
    pub millis_behind_latest: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CursorOutcome {
    pub exit: CursorExit,
    pub state: PartitionCursorState,
}

/// Shared dependencies of every cursor
pub struct CursorContext<C, S: LocationStore> {
    pub client: Arc<C>,
    pub store: StoreAdapter<S>,
    pub health: Arc<ConsumerHealth>,
    pub config: Arc<ConsumerConfig>,
    pub backoff: Arc<dyn Backoff>,
    pub monitoring_tx: Option<mpsc::Sender<IngestEvent>>,
}

impl<C, S: LocationStore> Clone for CursorContext<C, S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            store: self.store.clone(),
            health: self.health.clone(),
            config: self.config.clone(),
            backoff: self.backoff.clone(),
            monitoring_tx: self.monitoring_tx.clone(),
        }
    }
}

impl<C, S: LocationStore> CursorContext<C, S> {
    async fn send_monitoring_event(&self, event: IngestEvent) {
        if let Some(tx) = &self.monitoring_tx {
            if let Err(e) = tx.send(event).await {
                warn!(error = %e, "Failed to send monitoring event");
            } else {
                trace!("Sent monitoring event successfully");
            }
        }
    }
}

pub struct PartitionCursor<C, S: LocationStore> {
    ctx: CursorContext<C, S>,
    state: PartitionCursorState,
    phase: CursorPhase,
    stop: watch::Receiver<bool>,
}

impl<C, S> PartitionCursor<C, S>
where
    C: StreamClient + 'static,
    S: LocationStore + 'static,
{
    pub fn new(ctx: CursorContext<C, S>, partition_id: impl Into<String>, stop: watch::Receiver<bool>) -> Self {
        Self {
            ctx,
            state: PartitionCursorState {
                partition_id: partition_id.into(),
                ..Default::default()
            },
            phase: CursorPhase::Init,
            stop,
        }
    }

    pub fn phase(&self) -> CursorPhase {
        self.phase
    }

    pub fn state(&self) -> &PartitionCursorState {
        &self.state
    }

    fn partition_id(&self) -> &str {
        &self.state.partition_id
    }

    fn stop_requested(&self) -> bool {
        // A dropped sender counts as a stop
        self.stop.has_changed().is_err() || *self.stop.borrow()
    }

    /// Sleep for `delay`; returns false if the stop signal arrived first
    async fn pause(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            changed = self.stop.changed() => changed.is_ok() && !*self.stop.borrow(),
        }
    }

    async fn event(&self, event: IngestEvent) {
        self.ctx.send_monitoring_event(event).await;
    }

    async fn acquire(&self, position: &StartingPosition) -> Result<String, StreamClientError> {
        let config = &self.ctx.config;
        tokio::time::timeout(
            config.api_timeout,
            self.ctx
                .client
                .get_iterator(&config.stream_name, self.partition_id(), position),
        )
        .await
        .map_err(|_| StreamClientError::Timeout(config.api_timeout))?
    }

    async fn fetch(&self, iterator: &str) -> Result<RecordBatch, StreamClientError> {
        let config = &self.ctx.config;
        tokio::time::timeout(
            config.api_timeout,
            self.ctx.client.get_records(iterator, config.batch_size),
        )
        .await
        .map_err(|_| StreamClientError::Timeout(config.api_timeout))?
    }

    fn finish(mut self, exit: CursorExit) -> CursorOutcome {
        self.phase = CursorPhase::Stopped;
        CursorOutcome {
            exit,
            state: self.state,
        }
    }

    /// Drive the cursor until it stops or fails
    pub async fn run(mut self) -> CursorOutcome {
        info!(partition_id = %self.partition_id(), "Starting partition cursor");
        self.event(IngestEvent::partition(self.partition_id(), PartitionEventType::Started, None))
            .await;

        let exit = loop {
            if self.stop_requested() {
                break CursorExit::Stopped;
            }

            let next = match self.phase {
                CursorPhase::Init => self.init().await,
                CursorPhase::Polling => self.poll().await,
                CursorPhase::Backoff => self.backoff().await,
                CursorPhase::Stopped => Some(CursorExit::Stopped),
            };
            if let Some(exit) = next {
                break exit;
            }
        };

        let event_type = match exit {
            CursorExit::Stopped => PartitionEventType::Stopped,
            CursorExit::PartitionClosed => PartitionEventType::Closed,
            CursorExit::InitFailed | CursorExit::ReacquireFailed => PartitionEventType::Terminated,
        };
        self.event(IngestEvent::partition(
            self.partition_id(),
            event_type,
            Some(format!("{exit:?}")),
        ))
        .await;

        info!(
            partition_id = %self.partition_id(),
            exit = ?exit,
            last_sequence = ?self.state.last_sequence_number,
            "Partition cursor finished"
        );
        self.finish(exit)
    }

    async fn init(&mut self) -> Option<CursorExit> {
        let position = self.ctx.config.starting_position.clone();
        match self.acquire(&position).await {
            Ok(token) => {
                debug!(partition_id = %self.partition_id(), position = ?position, "Initial iterator acquired");
                self.state.iterator_token = Some(token);
                self.phase = CursorPhase::Polling;
                self.event(IngestEvent::iterator(self.partition_id(), IteratorEventType::Initial, None))
                    .await;
                None
            }
            Err(e) => {
                if e.is_permission_or_config() {
                    error!(
                        partition_id = %self.partition_id(),
                        error = %e,
                        hint = e.hint().unwrap_or("none"),
                        "Permission or configuration failure acquiring initial iterator, cursor terminating"
                    );
                } else {
                    error!(
                        partition_id = %self.partition_id(),
                        error = %e,
                        "Failed to acquire initial iterator, cursor terminating"
                    );
                }
                self.event(IngestEvent::iterator(
                    self.partition_id(),
                    IteratorEventType::Failed,
                    Some(e.detail()),
                ))
                .await;
                Some(CursorExit::InitFailed)
            }
        }
    }

    async fn poll(&mut self) -> Option<CursorExit> {
        let Some(iterator) = self.state.iterator_token.clone() else {
            return Some(CursorExit::PartitionClosed);
        };

        match self.fetch(&iterator).await {
            Ok(batch) => {
                self.state.consecutive_error_count = 0;
                self.state.millis_behind_latest = batch.millis_behind_latest;
                self.event(IngestEvent::fetched(
                    self.partition_id(),
                    batch.records.len(),
                    batch.millis_behind_latest,
                ))
                .await;

                let empty = batch.records.is_empty();
                if !empty {
                    self.process(&batch.records).await;
                }

                self.state.iterator_token = batch.next_iterator;
                if self.state.iterator_token.is_none() {
                    info!(partition_id = %self.partition_id(), "Partition closed and fully read");
                    return Some(CursorExit::PartitionClosed);
                }

                if empty {
                    trace!(partition_id = %self.partition_id(), "Empty poll");
                    let poll_interval = self.ctx.config.poll_interval;
                    if !self.pause(poll_interval).await {
                        return Some(CursorExit::Stopped);
                    }
                }
                None
            }
            Err(e) => {
                self.state.consecutive_error_count += 1;
                self.ctx.health.record_errors(1);
                if e.is_permission_or_config() {
                    error!(
                        partition_id = %self.partition_id(),
                        error = %e,
                        hint = e.hint().unwrap_or("none"),
                        consecutive_errors = self.state.consecutive_error_count,
                        "Permission or configuration failure fetching records, backing off"
                    );
                } else {
                    warn!(
                        partition_id = %self.partition_id(),
                        error = %e,
                        consecutive_errors = self.state.consecutive_error_count,
                        "Failed to fetch records, backing off"
                    );
                }
                self.event(IngestEvent::fetch_failed(
                    self.partition_id(),
                    e.detail(),
                    self.state.consecutive_error_count,
                ))
                .await;
                self.phase = CursorPhase::Backoff;
                None
            }
        }
    }

    async fn backoff(&mut self) -> Option<CursorExit> {
        let delay = self.ctx.backoff.next_delay(self.state.consecutive_error_count);
        debug!(
            partition_id = %self.partition_id(),
            delay_ms = delay.as_millis() as u64,
            "Backing off before reacquiring iterator"
        );
        if !self.pause(delay).await {
            return Some(CursorExit::Stopped);
        }

        let position = self
            .ctx
            .config
            .starting_position
            .resume_from(self.state.last_sequence_number.as_deref());

        match self.acquire(&position).await {
            Ok(token) => {
                debug!(partition_id = %self.partition_id(), position = ?position, "Iterator reacquired");
                self.state.iterator_token = Some(token);
                self.phase = CursorPhase::Polling;
                self.event(IngestEvent::iterator(
                    self.partition_id(),
                    IteratorEventType::Reacquired,
                    None,
                ))
                .await;
                None
            }
            Err(e) => {
                if e.is_permission_or_config() {
                    error!(
                        partition_id = %self.partition_id(),
                        error = %e,
                        hint = e.hint().unwrap_or("none"),
                        "Permission or configuration failure reacquiring iterator, cursor terminating"
                    );
                } else {
                    error!(
                        partition_id = %self.partition_id(),
                        error = %e,
                        "Failed to reacquire iterator, cursor terminating"
                    );
                }
                self.event(IngestEvent::iterator(
                    self.partition_id(),
                    IteratorEventType::Failed,
                    Some(e.detail()),
                ))
                .await;
                Some(CursorExit::ReacquireFailed)
            }
        }
    }

    /// Decode, store and account for one non-empty fetch
    async fn process(&mut self, records: &[StreamRecord]) {
        let started = Instant::now();
        let mut decoded = Vec::with_capacity(records.len());
        let mut decode_failures = 0;

        for record in records {
            match LocationRecord::decode(&record.data) {
                Ok(location) => decoded.push(location),
                Err(e) => {
                    decode_failures += 1;
                    warn!(
                        partition_id = %self.partition_id(),
                        sequence = %record.sequence_number,
                        error = %e,
                        "Skipping malformed record"
                    );
                }
            }
        }

        let stored = if decoded.is_empty() {
            0
        } else {
            self.ctx.store.store_batch(&decoded).await
        };

        let failed = decode_failures + decoded.len().saturating_sub(stored);
        let last_sequence = records.last().map(|r| r.sequence_number.clone());

        self.ctx.health.record_errors(failed);
        self.ctx
            .health
            .record_stored(stored, last_sequence.as_deref(), Utc::now());
        if last_sequence.is_some() {
            self.state.last_sequence_number = last_sequence;
        }

        debug!(
            partition_id = %self.partition_id(),
            received = records.len(),
            stored = stored,
            failed = failed,
            "Batch processed"
        );
        self.event(IngestEvent::batch_stored(
            self.partition_id(),
            records.len(),
            stored,
            decode_failures,
            started.elapsed(),
        ))
        .await;
    }
}
