//! Watchdog: periodic health scan over the worker registry.
//!
//! Classifies every registered worker as waiting or processing. When the
//! whole processing population has been stuck past the running-time
//! threshold and no worker is free to take over, the runtime is considered
//! deadlocked and a restart event is sent to the connector supervisor.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::WatchdogConfig;
use crate::server::worker::{ServerShared, WorkerMonitor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    Restart,
}

/// One scan over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub waiting: usize,
    pub processing: usize,
    pub exceeded: usize,
}

impl ScanSummary {
    /// Deadlock: someone is processing, every processing worker is over the
    /// threshold, and no worker is waiting to pick up the slack.
    pub fn deadlocked(&self) -> bool {
        self.processing > 0 && self.exceeded == self.processing && self.waiting == 0
    }
}

/// Classify a set of worker monitors against the running-time threshold.
pub fn assess(monitors: &[Arc<WorkerMonitor>], max_running: Duration) -> ScanSummary {
    let mut summary = ScanSummary::default();
    for monitor in monitors {
        match monitor.processing_for() {
            Some(elapsed) => {
                summary.processing += 1;
                if elapsed > max_running {
                    summary.exceeded += 1;
                }
            }
            None if !monitor.is_dead() => summary.waiting += 1,
            None => {}
        }
    }
    summary
}

pub struct Watchdog {
    shared: Arc<ServerShared>,
    config: WatchdogConfig,
    events: mpsc::Sender<WatchdogEvent>,
}

impl Watchdog {
    pub fn new(
        shared: Arc<ServerShared>,
        config: WatchdogConfig,
        events: mpsc::Sender<WatchdogEvent>,
    ) -> Self {
        Self {
            shared,
            config,
            events,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(
            interval_ms = self.config.interval_ms,
            max_running_ms = self.config.max_running_ms,
            recovery = self.config.recovery_enabled,
            "watchdog starting"
        );

        let mut ticker = time::interval(Duration::from_millis(self.config.interval_ms));
        // The first tick fires immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("watchdog stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if self.scan().await {
                        // One restart per scan; the supervisor tears this
                        // task down with everything else.
                        break;
                    }
                }
            }
        }
    }

    /// Returns true when a restart was requested.
    async fn scan(&self) -> bool {
        let monitors = self.shared.registry.snapshot();
        let summary = assess(&monitors, Duration::from_millis(self.config.max_running_ms));

        if summary.deadlocked() {
            tracing::error!(
                processing = summary.processing,
                max_running_ms = self.config.max_running_ms,
                "every processing worker is stuck past the threshold"
            );
            if self.config.recovery_enabled {
                return self.events.send(WatchdogEvent::Restart).await.is_ok();
            }
            return false;
        }

        tracing::trace!(
            waiting = summary.waiting,
            processing = summary.processing,
            exceeded = summary.exceeded,
            "watchdog scan"
        );
        false
    }
}
