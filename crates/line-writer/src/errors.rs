// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Failures reported by the write pipeline.
///
/// Delivery failures never come back from a `write_*` call. They are published on the
/// event channel and fail any `flush`/`close` whose scope contains the affected batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    /// Network error, 5xx, or 429. Handled by retries and only surfaced through
    /// [`WriteError::RetryExhausted`].
    #[error("transient transport error: {0}")]
    TransientTransport(String),

    /// The endpoint rejected the payload (4xx other than 429). Never retried.
    #[error("write rejected (status {status:?}): {message}")]
    FatalRequest { status: Option<u16>, message: String },

    /// The buffered-line ceiling was exceeded and the oldest unsent lines were dropped.
    #[error("buffer ceiling exceeded, dropped {dropped} oldest lines")]
    BufferOverflow { dropped: usize },

    /// A batch was abandoned once its retry budget ran out. `cause` is the last
    /// transient failure.
    #[error("batch {batch_id} abandoned after {attempts} attempts: {cause}")]
    RetryExhausted {
        batch_id: u64,
        attempts: u32,
        cause: Box<WriteError>,
    },

    #[error("write pipeline is closed")]
    Closed,

    /// Pending data was discarded by `dispose`.
    #[error("write pipeline disposed, {lines} lines discarded")]
    Cancelled { lines: usize },

    #[error("write pipeline service is not running")]
    ServiceUnavailable,
}

/// Errors raised while building a pipeline or transport configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("{0} environment variable is not set")]
    MissingVar(&'static str),

    #[error("Failed to parse {name}: {value:?}")]
    ParseVar { name: &'static str, value: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
