// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::{env, process::ExitCode, sync::Arc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use line_writer::{ClientConfig, HttpTransport, PipelineConfig, WriteService};

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var("LINE_PIPE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let pipeline_config = match PipelineConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading pipeline config: {e}");
            return ExitCode::FAILURE;
        }
    };
    let client_config = match ClientConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Error loading client config: {e}");
            return ExitCode::FAILURE;
        }
    };
    let transport = match HttpTransport::new(&client_config) {
        Ok(t) => Arc::new(t),
        Err(e) => {
            error!("Error creating HTTP transport: {e}");
            return ExitCode::FAILURE;
        }
    };
    let handle = match WriteService::spawn(pipeline_config, transport) {
        Ok(h) => h,
        Err(e) => {
            error!("Error starting write service: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!("Writing stdin to {}", client_config.url);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut count = 0u64;
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Err(e) = handle.write_record(&line) {
                        error!("Failed to queue record: {e}");
                        break;
                    }
                    count += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read stdin: {e}");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, draining pending records");
                break;
            }
        }
    }

    debug!("Read {count} records, closing");
    match handle.close().await {
        Ok(()) => {
            info!("All records delivered");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Some records were not delivered: {e}");
            ExitCode::FAILURE
        }
    }
}
