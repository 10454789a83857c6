// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::precision::WritePrecision;
use crate::tags::DefaultTags;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(1000);
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(5000);
pub const DEFAULT_EXPONENTIAL_BASE: u32 = 2;
pub const DEFAULT_MAX_RETRY_DELAY: Duration = Duration::from_millis(125_000);
pub const DEFAULT_MAX_RETRY_TIME: Duration = Duration::from_millis(180_000);
pub const DEFAULT_RETRY_JITTER: Duration = Duration::from_millis(200);
pub const DEFAULT_MAX_BUFFER_LINES: usize = 100_000;
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable settings of one write pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Records per batch; reaching it triggers an immediate extraction.
    pub batch_size: usize,
    /// Period of the background flush. Zero disables it.
    pub flush_interval: Duration,
    /// Retries after the first attempt. Zero disables retrying.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_interval: Duration,
    pub exponential_base: u32,
    /// Upper bound of a computed retry delay. A server-requested delay may exceed it.
    pub max_retry_delay: Duration,
    /// Budget from a batch's first attempt to its last retry. Zero disables it.
    pub max_retry_time: Duration,
    /// Upper bound of the random delay added to each retry.
    pub retry_jitter: Duration,
    /// Ceiling for queued plus outstanding lines.
    pub max_buffer_lines: usize,
    pub default_tags: DefaultTags,
    pub precision: WritePrecision,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            exponential_base: DEFAULT_EXPONENTIAL_BASE,
            max_retry_delay: DEFAULT_MAX_RETRY_DELAY,
            max_retry_time: DEFAULT_MAX_RETRY_TIME,
            retry_jitter: DEFAULT_RETRY_JITTER,
            max_buffer_lines: DEFAULT_MAX_BUFFER_LINES,
            default_tags: DefaultTags::default(),
            precision: WritePrecision::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl PipelineConfig {
    /// Defaults overridden by any `INFLUX_*` pipeline variables that are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            batch_size: env_parse("INFLUX_BATCH_SIZE")?.unwrap_or(defaults.batch_size),
            flush_interval: env_millis("INFLUX_FLUSH_INTERVAL_MS")?
                .unwrap_or(defaults.flush_interval),
            max_retries: env_parse("INFLUX_MAX_RETRIES")?.unwrap_or(defaults.max_retries),
            retry_interval: env_millis("INFLUX_RETRY_INTERVAL_MS")?
                .unwrap_or(defaults.retry_interval),
            exponential_base: env_parse("INFLUX_EXPONENTIAL_BASE")?
                .unwrap_or(defaults.exponential_base),
            max_retry_delay: env_millis("INFLUX_MAX_RETRY_DELAY_MS")?
                .unwrap_or(defaults.max_retry_delay),
            max_retry_time: env_millis("INFLUX_MAX_RETRY_TIME_MS")?
                .unwrap_or(defaults.max_retry_time),
            retry_jitter: env_millis("INFLUX_RETRY_JITTER_MS")?.unwrap_or(defaults.retry_jitter),
            max_buffer_lines: env_parse("INFLUX_MAX_BUFFER_LINES")?
                .unwrap_or(defaults.max_buffer_lines),
            default_tags: env::var("INFLUX_DEFAULT_TAGS")
                .map(|raw| DefaultTags::parse(&raw))
                .unwrap_or(defaults.default_tags),
            precision: env_parse("INFLUX_PRECISION")?.unwrap_or(defaults.precision),
            event_capacity: defaults.event_capacity,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be positive".to_string()));
        }
        if self.max_buffer_lines < self.batch_size {
            return Err(ConfigError::Invalid(format!(
                "max_buffer_lines ({}) must be at least batch_size ({})",
                self.max_buffer_lines, self.batch_size
            )));
        }
        if self.exponential_base == 0 {
            return Err(ConfigError::Invalid(
                "exponential_base must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid(
                "event_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where and how the HTTP transport writes.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `http://localhost:8086`.
    pub url: String,
    pub token: Option<String>,
    pub org: String,
    pub bucket: String,
    pub timeout: Duration,
    pub https_proxy: Option<String>,
}

impl ClientConfig {
    pub fn new(url: impl Into<String>, org: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            org: org.into(),
            bucket: bucket.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            https_proxy: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let url = env::var("INFLUX_URL").map_err(|_| ConfigError::MissingVar("INFLUX_URL"))?;
        let org = env::var("INFLUX_ORG").map_err(|_| ConfigError::MissingVar("INFLUX_ORG"))?;
        let bucket =
            env::var("INFLUX_BUCKET").map_err(|_| ConfigError::MissingVar("INFLUX_BUCKET"))?;

        let config = Self {
            url,
            token: env::var("INFLUX_TOKEN").ok().filter(|t| !t.is_empty()),
            org,
            bucket,
            timeout: env_millis("INFLUX_TIMEOUT_MS")?.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            https_proxy: env::var("INFLUX_PROXY_HTTPS")
                .or_else(|_| env::var("HTTPS_PROXY"))
                .ok(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.url.starts_with("http://") || self.url.starts_with("https://")) {
            return Err(ConfigError::Invalid(format!(
                "url must start with http:// or https://, got {:?}",
                self.url
            )));
        }
        if self.org.is_empty() {
            return Err(ConfigError::Invalid("org must not be empty".to_string()));
        }
        if self.bucket.is_empty() {
            return Err(ConfigError::Invalid("bucket must not be empty".to_string()));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::ParseVar { name, value }),
        Err(_) => Ok(None),
    }
}

fn env_millis(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(name)?.map(Duration::from_millis))
}
