// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffered, batching, retrying writer for line-protocol HTTP write endpoints.
//!
//! Records (raw protocol lines or [`Point`]s) are handed to a [`WriteHandle`], which never
//! blocks on the network. A background [`WriteService`] groups them into batches, sends
//! each batch through a [`Transport`], and retries retryable failures with exponential
//! backoff. Delivery problems are reported through [`PipelineEvent`]s and through the
//! outcome of [`WriteHandle::flush`] and [`WriteHandle::close`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod config;
pub mod errors;
pub mod events;
pub mod http;
pub mod point;
pub mod precision;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod tags;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::{ClientConfig, PipelineConfig};
pub use errors::{ConfigError, WriteError};
pub use events::PipelineEvent;
pub use http::HttpTransport;
pub use point::{FieldValue, Point, PointTime};
pub use precision::WritePrecision;
pub use service::{Lifecycle, PipelineStats, WriteHandle, WriteService};
pub use tags::DefaultTags;
pub use transport::{DeliveryOutcome, Transport};
