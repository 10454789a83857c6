// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{error, warn};

use crate::errors::WriteError;

/// Pipeline health notifications, published independently of `flush`/`close` outcomes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A batch failed with a retryable error and will be sent again after `delay`.
    RetryScheduled {
        batch_id: u64,
        attempt: u32,
        lines: usize,
        delay: Duration,
        cause: String,
    },
    /// Data was lost: ceiling eviction, fatal rejection, or exhausted retries.
    Error(WriteError),
}

impl PipelineEvent {
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    pub fn is_warning(&self) -> bool {
        matches!(self, Self::RetryScheduled { .. })
    }
}

/// Logs every event through `tracing` and fans it out to subscribers.
#[derive(Clone)]
pub(crate) struct EventPublisher {
    tx: broadcast::Sender<PipelineEvent>,
}

impl EventPublisher {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<PipelineEvent> {
        self.tx.clone()
    }

    pub(crate) fn retry_scheduled(
        &self,
        batch_id: u64,
        attempt: u32,
        lines: usize,
        delay: Duration,
        cause: String,
    ) {
        warn!(
            "Write of batch {batch_id} ({lines} lines) failed on attempt {attempt}, retrying in {} ms: {cause}",
            delay.as_millis()
        );
        self.publish(PipelineEvent::RetryScheduled {
            batch_id,
            attempt,
            lines,
            delay,
            cause,
        });
    }

    pub(crate) fn error(&self, err: WriteError) {
        error!("Write failed: {err}");
        self.publish(PipelineEvent::Error(err));
    }

    fn publish(&self, event: PipelineEvent) {
        // No subscribers is fine, the event has been logged.
        let _ = self.tx.send(event);
    }
}
