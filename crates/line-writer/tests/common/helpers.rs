// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Helper functions for integration tests

use line_writer::{ClientConfig, HttpTransport, PipelineConfig, PipelineEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Pipeline settings with short, jitter-free retry delays
#[allow(dead_code)]
pub fn fast_retry_config(max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        flush_interval: Duration::ZERO,
        max_retries,
        retry_interval: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(100),
        retry_jitter: Duration::ZERO,
        ..Default::default()
    }
}

#[allow(dead_code)]
pub fn http_transport(url: String) -> Arc<HttpTransport> {
    let config = ClientConfig::new(url, "my-org", "my-bucket").with_token("my-token");
    Arc::new(HttpTransport::new(&config).expect("failed to create transport"))
}

/// Counts `(warnings, errors)` received so far
#[allow(dead_code)]
pub fn count_events(rx: &mut broadcast::Receiver<PipelineEvent>) -> (usize, usize) {
    let mut warnings = 0;
    let mut errors = 0;
    while let Ok(event) = rx.try_recv() {
        if event.is_warning() {
            warnings += 1;
        } else if event.is_error() {
            errors += 1;
        }
    }
    (warnings, errors)
}
