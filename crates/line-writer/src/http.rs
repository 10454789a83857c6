// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use std::time::Instant;
use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::ConfigError;
use crate::precision::WritePrecision;
use crate::transport::{classify_status, parse_retry_after, DeliveryOutcome, Transport};

/// Builds the shared client, routing through `https_proxy` when set.
pub fn build_client(config: &ClientConfig) -> Result<reqwest::Client, ConfigError> {
    let mut builder = reqwest::Client::builder().timeout(config.timeout);
    if let Some(proxy) = &config.https_proxy {
        builder = builder.proxy(reqwest::Proxy::https(proxy)?);
    }
    Ok(builder.build()?)
}

/// Posts batches to `{url}/api/v2/write`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    write_url: String,
    org: String,
    bucket: String,
    headers: HeaderMap,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = build_client(config)?;

        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        if let Some(token) = &config.token {
            let value = HeaderValue::from_str(&format!("Token {token}"))
                .map_err(|_| ConfigError::Invalid("token is not a valid header value".into()))?;
            headers.insert(AUTHORIZATION, value);
        }

        Ok(Self {
            client,
            write_url: format!("{}/api/v2/write", config.url.trim_end_matches('/')),
            org: config.org.clone(),
            bucket: config.bucket.clone(),
            headers,
        })
    }

    pub fn write_url(&self) -> &str {
        &self.write_url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: String, precision: WritePrecision) -> DeliveryOutcome {
        let time = Instant::now();
        let response = self
            .client
            .post(&self.write_url)
            .query(&[
                ("org", self.org.as_str()),
                ("bucket", self.bucket.as_str()),
                ("precision", precision.as_str()),
            ])
            .headers(self.headers.clone())
            .body(payload)
            .send()
            .await;
        let elapsed = time.elapsed();

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    debug!("Write accepted with {status} in {} ms", elapsed.as_millis());
                    return DeliveryOutcome::Success;
                }
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body = resp.text().await.unwrap_or_default();
                classify_status(status, retry_after, &body)
            }
            Err(e) if e.is_builder() => DeliveryOutcome::Fatal {
                status: None,
                cause: format!("invalid request: {e}"),
            },
            Err(e) => DeliveryOutcome::Retryable {
                retry_after: None,
                cause: format!("request failed after {} ms: {e}", elapsed.as_millis()),
            },
        }
    }
}
