// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Mock transports for driving the write service without a server

use line_writer::{DeliveryOutcome, Transport, WritePrecision};
use std::sync::{Arc, Mutex};

/// Accepts every payload and keeps it, together with the precision it was sent with
#[derive(Default)]
pub struct RecordingTransport {
    received: Mutex<Vec<(String, WritePrecision)>>,
}

#[allow(dead_code)]
impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn payloads(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(payload, _)| payload.clone())
            .collect()
    }

    pub fn precisions(&self) -> Vec<WritePrecision> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, precision)| *precision)
            .collect()
    }

    /// All delivered lines, in delivery order
    pub fn lines(&self) -> Vec<String> {
        self.payloads()
            .iter()
            .flat_map(|payload| payload.split('\n').map(str::to_string).collect::<Vec<_>>())
            .collect()
    }
}

#[async_trait::async_trait]
impl Transport for RecordingTransport {
    async fn send(&self, payload: String, precision: WritePrecision) -> DeliveryOutcome {
        self.received.lock().unwrap().push((payload, precision));
        DeliveryOutcome::Success
    }
}
