//! Background lease reaper.
//!
//! Runs [`JobQueue::reap_expired`] on a fixed interval until a shutdown
//! signal is broadcast. A failed pass is logged and retried on the next tick.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::job_queue::{JobQueue, ReapSummary};

/// Periodically returns jobs with expired leases to pending.
pub struct LeaseReaper {
    queue: Arc<JobQueue>,
    interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
}

impl LeaseReaper {
    pub fn new(queue: Arc<JobQueue>, interval: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            queue,
            interval,
            shutdown_tx,
        }
    }

    /// Returns a sender that stops the reaper when sent to.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Sends the shutdown signal.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Runs one pass immediately.
    pub async fn run_once(&self) -> Result<ReapSummary, crate::error::QueueError> {
        self.queue.reap_expired().await
    }

    /// Spawns the reaper loop. The first pass runs immediately.
    ///
    /// The returned handle resolves to the totals over all passes.
    pub fn spawn(&self) -> JoinHandle<ReapSummary> {
        let queue = self.queue.clone();
        let interval = self.interval;
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(run_loop(queue, interval, shutdown_rx))
    }
}

async fn run_loop(
    queue: Arc<JobQueue>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> ReapSummary {
    info!(interval_secs = interval.as_secs_f64(), "Lease reaper started");

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut totals = ReapSummary::default();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Lease reaper received shutdown signal");
                break;
            }
            _ = ticker.tick() => {
                match queue.reap_expired().await {
                    Ok(summary) => {
                        totals.requeued += summary.requeued;
                        totals.failed += summary.failed;
                    }
                    Err(e) => error!(error = %e, "Lease reaper pass failed"),
                }
            }
        }
    }

    info!(
        requeued = totals.requeued,
        failed = totals.failed,
        "Lease reaper stopped"
    );
    totals
}
