// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;

use crate::precision::WritePrecision;

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Success,
    /// Worth retrying; `retry_after` is the server's requested minimum delay.
    Retryable {
        retry_after: Option<Duration>,
        cause: String,
    },
    /// The request itself is invalid or unauthorized; retrying cannot help.
    Fatal { status: Option<u16>, cause: String },
}

/// Sends one batch payload to the write endpoint.
///
/// Implementations must tolerate concurrent calls for different batches. The pipeline never
/// sends the same batch twice at once.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send(&self, payload: String, precision: WritePrecision) -> DeliveryOutcome;
}

/// Maps an HTTP response status to a delivery outcome.
///
/// 2xx is success. 429 and every 5xx are retryable. Any other status is fatal.
pub fn classify_status(
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Success;
    }
    let cause = if body.is_empty() {
        format!("status {status}")
    } else {
        format!("status {status}: {body}")
    };
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        DeliveryOutcome::Retryable { retry_after, cause }
    } else {
        DeliveryOutcome::Fatal {
            status: Some(status.as_u16()),
            cause,
        }
    }
}

/// Longest server-requested delay honoured before a retry.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Parses a `Retry-After` header given in whole seconds, capped at [`MAX_RETRY_AFTER`].
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}
