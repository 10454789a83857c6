// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The write service: sole owner of buffered records and outstanding batches.
//!
//! Callers talk to it through a cloneable [`WriteHandle`]. Every state change goes through
//! the service task, which consumes two channels:
//!
//! ```text
//!   WriteHandle ──commands──┐
//!                           v
//!                    ┌──────────────┐   spawn    ┌───────────┐
//!                    │ WriteService │ ─────────> │ Transport │
//!                    └──────────────┘            └─────┬─────┘
//!                           ^                          │
//!   FlushScheduler ─tick────┤                          │
//!   retry timers ──due──────┤                          │
//!                           └──────── delivered ───────┘
//! ```
//!
//! Writes never wait on the network. `flush` and `close` wait on a oneshot that the service
//! completes once every batch in their scope has resolved.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::buffer::{Batch, RecordBuffer};
use crate::config::PipelineConfig;
use crate::errors::{ConfigError, WriteError};
use crate::events::{EventPublisher, PipelineEvent};
use crate::point::Point;
use crate::retry::{RetryController, RetryDecision, RetryState};
use crate::scheduler::FlushScheduler;
use crate::transport::{DeliveryOutcome, Transport};

/// Pipeline lifecycle. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    Open = 0,
    Closing = 1,
    Closed = 2,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Open,
            1 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Point-in-time line counts of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineStats {
    pub buffered: usize,
    /// Size of the buffered lines, separators excluded.
    pub buffered_bytes: usize,
    pub in_flight: usize,
    pub retry_pending: usize,
    pub dropped: u64,
    pub lifecycle: Lifecycle,
}

#[derive(Debug)]
pub(crate) enum WriteCommand {
    Write(Vec<String>),
    Flush(oneshot::Sender<Result<(), WriteError>>),
    Close(oneshot::Sender<Result<(), WriteError>>),
    Dispose(oneshot::Sender<Result<usize, WriteError>>),
    Stats(oneshot::Sender<PipelineStats>),
}

/// Notifications from tasks spawned by the service itself.
#[derive(Debug)]
pub(crate) enum ServiceEvent {
    Tick,
    Delivered {
        batch_id: u64,
        outcome: DeliveryOutcome,
    },
    RetryDue {
        batch_id: u64,
    },
}

#[derive(Clone)]
pub struct WriteHandle {
    tx: mpsc::UnboundedSender<WriteCommand>,
    config: Arc<PipelineConfig>,
    lifecycle: Arc<AtomicU8>,
    events: broadcast::Sender<PipelineEvent>,
}

impl WriteHandle {
    /// Queues one pre-formatted protocol line. Default tags are merged in here.
    pub fn write_record(&self, record: impl AsRef<str>) -> Result<(), WriteError> {
        self.write_records(std::iter::once(record))
    }

    /// Queues several protocol lines, kept in order. A record holding several
    /// newline-separated lines is queued line by line. Blank lines are skipped.
    pub fn write_records<I, S>(&self, records: I) -> Result<(), WriteError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.ensure_open()?;
        let mut lines = Vec::new();
        for record in records {
            for line in record.as_ref().split('\n') {
                let line = line.trim_end_matches('\r');
                if !line.trim().is_empty() {
                    lines.push(self.config.default_tags.apply(line));
                }
            }
        }
        self.send_lines(lines)
    }

    pub fn write_point(&self, point: &Point) -> Result<(), WriteError> {
        self.write_points(std::iter::once(point))
    }

    /// Serializes and queues points. Points without fields are skipped with a warning.
    pub fn write_points<'a, I>(&self, points: I) -> Result<(), WriteError>
    where
        I: IntoIterator<Item = &'a Point>,
    {
        self.ensure_open()?;
        let lines = points
            .into_iter()
            .filter_map(|point| {
                let line = point.to_line(self.config.precision, &self.config.default_tags);
                if line.is_none() {
                    warn!("Skipping point {:?} without fields", point.measurement());
                }
                line
            })
            .collect();
        self.send_lines(lines)
    }

    /// Sends everything buffered now and waits until those batches are delivered or dropped.
    pub async fn flush(&self) -> Result<(), WriteError> {
        self.request(WriteCommand::Flush).await?
    }

    /// Stops accepting writes, drains buffered and outstanding batches, and reports the
    /// outcome. Every call, concurrent or later, receives the same outcome.
    pub async fn close(&self) -> Result<(), WriteError> {
        self.request(WriteCommand::Close).await?
    }

    /// Closes without draining: buffered records and pending retries are discarded and
    /// in-flight attempts aborted. Returns how many lines were discarded.
    pub async fn dispose(&self) -> Result<usize, WriteError> {
        self.request(WriteCommand::Dispose).await?
    }

    pub async fn stats(&self) -> Result<PipelineStats, WriteError> {
        self.request(WriteCommand::Stats).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.events.subscribe()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn ensure_open(&self) -> Result<(), WriteError> {
        match self.lifecycle() {
            Lifecycle::Open => Ok(()),
            _ => Err(WriteError::Closed),
        }
    }

    fn send_lines(&self, lines: Vec<String>) -> Result<(), WriteError> {
        if lines.is_empty() {
            return Ok(());
        }
        self.tx
            .send(WriteCommand::Write(lines))
            .map_err(|_| WriteError::ServiceUnavailable)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WriteCommand,
    ) -> Result<T, WriteError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(command(response_tx))
            .map_err(|_| WriteError::ServiceUnavailable)?;
        response_rx
            .await
            .map_err(|_| WriteError::ServiceUnavailable)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    InFlight,
    RetryScheduled,
}

struct BatchEntry {
    batch: Batch,
    retry: RetryState,
    phase: Phase,
    /// Send task while in flight, timer task while waiting for a retry.
    task: Option<JoinHandle<()>>,
    /// Lines evicted from this batch while it waited for a retry.
    evicted: usize,
}

struct FlushWaiter {
    pending: HashSet<u64>,
    error: Option<WriteError>,
    tx: oneshot::Sender<Result<(), WriteError>>,
}

impl FlushWaiter {
    fn complete(self) {
        let result = match self.error {
            Some(err) => Err(err),
            None => Ok(()),
        };
        if self.tx.send(result).is_err() {
            debug!("Flush caller went away before completion");
        }
    }
}

pub struct WriteService {
    config: Arc<PipelineConfig>,
    transport: Arc<dyn Transport>,
    buffer: RecordBuffer,
    retry: RetryController,
    batches: BTreeMap<u64, BatchEntry>,
    /// Lines held by `batches`.
    outstanding: usize,
    /// Timer-initiated batches whose attempt has not returned yet.
    auto_in_flight: HashSet<u64>,
    flush_waiters: Vec<FlushWaiter>,
    close_waiters: Vec<oneshot::Sender<Result<(), WriteError>>>,
    close_error: Option<WriteError>,
    terminal: Option<Result<(), WriteError>>,
    lifecycle: Arc<AtomicU8>,
    scheduler: Option<FlushScheduler>,
    events: EventPublisher,
    rx: mpsc::UnboundedReceiver<WriteCommand>,
    service_tx: mpsc::UnboundedSender<ServiceEvent>,
    service_rx: mpsc::UnboundedReceiver<ServiceEvent>,
}

impl WriteService {
    pub fn new(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<(Self, WriteHandle), ConfigError> {
        config.validate()?;
        let config = Arc::new(config);
        let (tx, rx) = mpsc::unbounded_channel();
        let (service_tx, service_rx) = mpsc::unbounded_channel();
        let events = EventPublisher::new(config.event_capacity);
        let lifecycle = Arc::new(AtomicU8::new(Lifecycle::Open as u8));

        let handle = WriteHandle {
            tx,
            config: Arc::clone(&config),
            lifecycle: Arc::clone(&lifecycle),
            events: events.sender(),
        };

        let service = Self {
            buffer: RecordBuffer::new(config.batch_size, config.max_buffer_lines),
            retry: RetryController::new(&config),
            config,
            transport,
            batches: BTreeMap::new(),
            outstanding: 0,
            auto_in_flight: HashSet::new(),
            flush_waiters: Vec::new(),
            close_waiters: Vec::new(),
            close_error: None,
            terminal: None,
            lifecycle,
            scheduler: None,
            events,
            rx,
            service_tx,
            service_rx,
        };

        Ok((service, handle))
    }

    /// Builds the service and runs it on the current tokio runtime.
    pub fn spawn(
        config: PipelineConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<WriteHandle, ConfigError> {
        let (service, handle) = Self::new(config, transport)?;
        tokio::spawn(service.run());
        Ok(handle)
    }

    pub async fn run(mut self) {
        debug!("Write service started");
        self.scheduler = FlushScheduler::start(self.config.flush_interval, self.service_tx.clone());

        let mut accepting = true;
        loop {
            tokio::select! {
                command = self.rx.recv(), if accepting => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All write handles dropped, draining");
                        accepting = false;
                        self.begin_close(None);
                    }
                },
                Some(event) = self.service_rx.recv() => self.handle_event(event),
            }
            if !accepting && self.lifecycle() == Lifecycle::Closed {
                break;
            }
        }

        debug!("Write service stopped");
    }

    fn handle_command(&mut self, command: WriteCommand) {
        match command {
            WriteCommand::Write(lines) => self.handle_write(lines),
            WriteCommand::Flush(response_tx) => self.handle_flush(response_tx),
            WriteCommand::Close(response_tx) => self.begin_close(Some(response_tx)),
            WriteCommand::Dispose(response_tx) => {
                let result = self.dispose();
                if response_tx.send(result).is_err() {
                    error!("Failed to send dispose response - receiver dropped");
                }
            }
            WriteCommand::Stats(response_tx) => {
                if response_tx.send(self.stats()).is_err() {
                    error!("Failed to send stats response - receiver dropped");
                }
            }
        }
    }

    fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Tick => self.handle_tick(),
            ServiceEvent::Delivered { batch_id, outcome } => {
                self.handle_delivered(batch_id, outcome)
            }
            ServiceEvent::RetryDue { batch_id } => {
                let due = self
                    .batches
                    .get(&batch_id)
                    .is_some_and(|entry| entry.phase == Phase::RetryScheduled);
                if due {
                    self.start_attempt(batch_id);
                }
            }
        }
    }

    fn handle_write(&mut self, lines: Vec<String>) {
        if self.lifecycle() != Lifecycle::Open {
            warn!("Discarding {} lines written after close", lines.len());
            self.events.error(WriteError::Closed);
            return;
        }

        let mut dropped = 0;
        for line in lines {
            dropped += self.make_room();
            dropped += self.buffer.append(line, self.outstanding);
            while let Some(batch) = self.buffer.extract_ready(false) {
                self.dispatch(batch, false);
            }
        }
        if dropped > 0 {
            self.events.error(WriteError::BufferOverflow { dropped });
        }
    }

    /// Evicts the oldest lines of batches waiting for a retry so that one more record fits
    /// under the ceiling. In-flight batches are never touched. Returns the lines evicted.
    fn make_room(&mut self) -> usize {
        let mut excess = (self.buffer.len() + 1 + self.outstanding)
            .saturating_sub(self.config.max_buffer_lines);
        if excess == 0 {
            return 0;
        }

        let mut evicted = 0;
        let mut emptied = Vec::new();
        for (id, entry) in self.batches.iter_mut() {
            if excess == 0 {
                break;
            }
            if entry.phase != Phase::RetryScheduled {
                continue;
            }
            let removed = entry.batch.drop_oldest(excess);
            entry.evicted += removed;
            excess -= removed;
            evicted += removed;
            if entry.batch.is_empty() {
                emptied.push(*id);
            }
        }
        self.outstanding -= evicted;
        self.buffer.record_dropped(evicted);

        for id in emptied {
            debug!("Batch {id} fully evicted while waiting for a retry");
            self.resolve(id, Ok(()));
        }
        evicted
    }

    fn handle_flush(&mut self, response_tx: oneshot::Sender<Result<(), WriteError>>) {
        let batches = self.buffer.extract_all();
        if batches.is_empty() {
            if response_tx.send(Ok(())).is_err() {
                debug!("Flush caller went away before completion");
            }
            return;
        }

        debug!("Flushing {} batches", batches.len());
        let mut pending = HashSet::with_capacity(batches.len());
        for batch in batches {
            pending.insert(self.dispatch(batch, false));
        }
        self.flush_waiters.push(FlushWaiter {
            pending,
            error: None,
            tx: response_tx,
        });
    }

    fn handle_tick(&mut self) {
        if self.lifecycle() != Lifecycle::Open
            || !self.auto_in_flight.is_empty()
            || self.buffer.is_empty()
        {
            return;
        }
        let batches = self.buffer.extract_all();
        debug!("Timed flush of {} batches", batches.len());
        for batch in batches {
            self.dispatch(batch, true);
        }
    }

    fn dispatch(&mut self, batch: Batch, timed: bool) -> u64 {
        let batch_id = batch.id;
        self.outstanding += batch.len();
        self.batches.insert(
            batch_id,
            BatchEntry {
                batch,
                retry: RetryState::default(),
                phase: Phase::InFlight,
                task: None,
                evicted: 0,
            },
        );
        if timed {
            self.auto_in_flight.insert(batch_id);
        }
        self.start_attempt(batch_id);
        batch_id
    }

    fn start_attempt(&mut self, batch_id: u64) {
        let Some(entry) = self.batches.get_mut(&batch_id) else {
            return;
        };
        entry.retry.begin_attempt(Instant::now());
        entry.phase = Phase::InFlight;
        debug!(
            "Sending batch {batch_id} ({} lines), attempt {}",
            entry.batch.len(),
            entry.retry.attempts
        );

        let payload = entry.batch.payload();
        let transport = Arc::clone(&self.transport);
        let precision = self.config.precision;
        let service_tx = self.service_tx.clone();
        entry.task = Some(tokio::spawn(async move {
            let outcome = transport.send(payload, precision).await;
            // The service only stops once nothing is outstanding.
            let _ = service_tx.send(ServiceEvent::Delivered { batch_id, outcome });
        }));
    }

    fn handle_delivered(&mut self, batch_id: u64, outcome: DeliveryOutcome) {
        self.auto_in_flight.remove(&batch_id);
        let Some(entry) = self.batches.get_mut(&batch_id) else {
            debug!("Ignoring outcome of discarded batch {batch_id}");
            return;
        };
        entry.task = None;

        match outcome {
            DeliveryOutcome::Success => {
                debug!("Batch {batch_id} delivered");
                self.resolve(batch_id, Ok(()));
            }
            DeliveryOutcome::Fatal { status, cause } => {
                let err = WriteError::FatalRequest {
                    status,
                    message: cause,
                };
                self.events.error(err.clone());
                self.resolve(batch_id, Err(err));
            }
            DeliveryOutcome::Retryable { retry_after, cause } => {
                let now = Instant::now();
                match self.retry.on_failure(&entry.retry, retry_after, now) {
                    RetryDecision::Abandon => {
                        let err = WriteError::RetryExhausted {
                            batch_id,
                            attempts: entry.retry.attempts,
                            cause: Box::new(WriteError::TransientTransport(cause)),
                        };
                        self.events.error(err.clone());
                        self.resolve(batch_id, Err(err));
                    }
                    RetryDecision::Retry { delay } => {
                        entry.phase = Phase::RetryScheduled;
                        self.events.retry_scheduled(
                            batch_id,
                            entry.retry.attempts,
                            entry.batch.len(),
                            delay,
                            cause,
                        );
                        let service_tx = self.service_tx.clone();
                        entry.task = Some(tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = service_tx.send(ServiceEvent::RetryDue { batch_id });
                        }));
                    }
                }
            }
        }
    }

    /// Removes a finished batch and completes any flush or close waiting on it.
    fn resolve(&mut self, batch_id: u64, mut result: Result<(), WriteError>) {
        let Some(entry) = self.batches.remove(&batch_id) else {
            return;
        };
        if let Some(task) = entry.task {
            task.abort();
        }
        self.outstanding -= entry.batch.len();
        self.auto_in_flight.remove(&batch_id);
        if result.is_ok() && entry.evicted > 0 {
            result = Err(WriteError::BufferOverflow {
                dropped: entry.evicted,
            });
        }

        for mut waiter in std::mem::take(&mut self.flush_waiters) {
            if waiter.pending.remove(&batch_id) {
                if let Err(err) = &result {
                    waiter.error.get_or_insert_with(|| err.clone());
                }
            }
            if waiter.pending.is_empty() {
                waiter.complete();
            } else {
                self.flush_waiters.push(waiter);
            }
        }

        if self.lifecycle() == Lifecycle::Closing {
            if let Err(err) = result {
                self.close_error.get_or_insert(err);
            }
            self.maybe_finish_close();
        }
    }

    fn begin_close(&mut self, response_tx: Option<oneshot::Sender<Result<(), WriteError>>>) {
        match self.lifecycle() {
            Lifecycle::Closed => {
                if let Some(response_tx) = response_tx {
                    let terminal = self.terminal.clone().unwrap_or(Ok(()));
                    if response_tx.send(terminal).is_err() {
                        debug!("Close caller went away before completion");
                    }
                }
            }
            Lifecycle::Closing => {
                if let Some(response_tx) = response_tx {
                    self.close_waiters.push(response_tx);
                }
            }
            Lifecycle::Open => {
                debug!("Closing write service");
                self.set_lifecycle(Lifecycle::Closing);
                if let Some(scheduler) = self.scheduler.take() {
                    scheduler.stop();
                }
                if let Some(response_tx) = response_tx {
                    self.close_waiters.push(response_tx);
                }
                for batch in self.buffer.extract_all() {
                    self.dispatch(batch, false);
                }
                self.maybe_finish_close();
            }
        }
    }

    fn maybe_finish_close(&mut self) {
        if self.lifecycle() != Lifecycle::Closing || !self.batches.is_empty() {
            return;
        }
        let result = match self.close_error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        };
        self.set_lifecycle(Lifecycle::Closed);
        self.terminal = Some(result.clone());
        for response_tx in self.close_waiters.drain(..) {
            if response_tx.send(result.clone()).is_err() {
                debug!("Close caller went away before completion");
            }
        }
        debug!("Write service closed");
    }

    fn dispose(&mut self) -> Result<usize, WriteError> {
        if self.lifecycle() == Lifecycle::Closed {
            return Ok(0);
        }
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.stop();
        }

        let mut discarded = self.buffer.clear();
        for (_, entry) in std::mem::take(&mut self.batches) {
            if let Some(task) = entry.task {
                task.abort();
            }
            discarded += entry.batch.len();
        }
        self.outstanding = 0;
        self.auto_in_flight.clear();
        if discarded > 0 {
            warn!("Write service disposed, discarded {discarded} lines");
        }

        let cancelled = WriteError::Cancelled { lines: discarded };
        for waiter in self.flush_waiters.drain(..) {
            if waiter.tx.send(Err(cancelled.clone())).is_err() {
                debug!("Flush caller went away before completion");
            }
        }
        let terminal = match self.close_error.take() {
            Some(err) => Err(err),
            None if discarded > 0 => Err(cancelled),
            None => Ok(()),
        };
        for response_tx in self.close_waiters.drain(..) {
            if response_tx.send(terminal.clone()).is_err() {
                debug!("Close caller went away before completion");
            }
        }
        self.terminal = Some(terminal);
        self.set_lifecycle(Lifecycle::Closed);
        Ok(discarded)
    }

    fn stats(&self) -> PipelineStats {
        let mut in_flight = 0;
        let mut retry_pending = 0;
        for entry in self.batches.values() {
            match entry.phase {
                Phase::InFlight => in_flight += entry.batch.len(),
                Phase::RetryScheduled => retry_pending += entry.batch.len(),
            }
        }
        PipelineStats {
            buffered: self.buffer.len(),
            buffered_bytes: self.buffer.bytes(),
            in_flight,
            retry_pending,
            dropped: self.buffer.dropped(),
            lifecycle: self.lifecycle(),
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::Acquire))
    }

    fn set_lifecycle(&self, next: Lifecycle) {
        self.lifecycle.fetch_max(next as u8, Ordering::AcqRel);
    }
}
