// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for write service tests.

#![cfg(test)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::time::Instant;

use crate::events::PipelineEvent;
use crate::precision::WritePrecision;
use crate::transport::{DeliveryOutcome, Transport};

/// Transport replaying a fixed list of outcomes, then `fallback` forever.
pub(crate) struct ScriptedTransport {
    script: Mutex<VecDeque<DeliveryOutcome>>,
    fallback: DeliveryOutcome,
    latency: Duration,
    sent: Mutex<Vec<(String, Instant)>>,
}

impl ScriptedTransport {
    pub(crate) fn always(outcome: DeliveryOutcome) -> Arc<Self> {
        Self::scripted(vec![], outcome)
    }

    pub(crate) fn scripted(outcomes: Vec<DeliveryOutcome>, fallback: DeliveryOutcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(outcomes.into()),
            fallback,
            latency: Duration::ZERO,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn with_latency(outcome: DeliveryOutcome, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: outcome,
            latency,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn payloads(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(payload, _)| payload.clone())
            .collect()
    }

    pub(crate) fn sent_at(&self) -> Vec<Instant> {
        self.sent
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|(_, at)| *at)
            .collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.sent.lock().expect("lock poisoned").len()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&self, payload: String, _precision: WritePrecision) -> DeliveryOutcome {
        self.sent
            .lock()
            .expect("lock poisoned")
            .push((payload, Instant::now()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let next = self.script.lock().expect("lock poisoned").pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

pub(crate) fn retryable(cause: &str) -> DeliveryOutcome {
    DeliveryOutcome::Retryable {
        retry_after: None,
        cause: cause.to_string(),
    }
}

/// Drains the events received so far into `(warnings, errors)`.
pub(crate) fn drain_events(
    rx: &mut broadcast::Receiver<PipelineEvent>,
) -> (Vec<PipelineEvent>, Vec<PipelineEvent>) {
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.is_error() {
            errors.push(event);
        } else {
            warnings.push(event);
        }
    }
    (warnings, errors)
}
