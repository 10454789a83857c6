// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::service::ServiceEvent;

/// Background timer asking the write service for a flush every `period`.
///
/// Whether a tick actually flushes is decided by the service, which skips ticks while a
/// timer-initiated delivery is still in flight.
pub struct FlushScheduler {
    cancel_token: CancellationToken,
    task: JoinHandle<()>,
}

impl FlushScheduler {
    /// Starts the timer. Returns `None` when `period` is zero, which disables timed flushes.
    pub(crate) fn start(
        period: Duration,
        events: mpsc::UnboundedSender<ServiceEvent>,
    ) -> Option<Self> {
        if period.is_zero() {
            debug!("Flush interval is zero, timed flushes disabled");
            return None;
        }
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        if events.send(ServiceEvent::Tick).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Flush scheduler stopped");
        });
        Some(Self { cancel_token, task })
    }

    pub fn stop(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel_token.is_cancelled() || self.task.is_finished()
    }
}

impl Drop for FlushScheduler {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}
