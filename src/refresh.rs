//! Scheduled sync cycles
//!
//! Runs the coordinator on a tokio interval in a background task and reports
//! every cycle over a channel. The task owns the coordinator, so cycles run
//! strictly one after another. Reports never hold up the schedule: while the
//! channel is full they are dropped.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::location::LocationContext;
use crate::sync::{SyncCoordinator, Synced};

/// Capacity of the report channel
const REPORT_CAPACITY: usize = 32;

/// Messages sent from the background task
#[derive(Debug, Clone)]
pub enum SyncMessage {
    /// A cycle is starting
    CycleStarted,
    /// A cycle produced a dataset
    CycleCompleted(Synced),
    /// A cycle failed (empty store or store fault)
    CycleFailed(String),
}

/// Configuration for the refresh schedule
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Time between scheduled cycles
    pub interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300), // 5 minutes
        }
    }
}

/// Handle for controlling the background sync task
pub struct RefreshHandle {
    /// Channel for receiving cycle reports
    ///
    /// Holds up to 32 unread reports; later ones are dropped until it is
    /// drained.
    pub receiver: mpsc::Receiver<SyncMessage>,
    trigger_tx: mpsc::Sender<()>,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<SyncCoordinator>,
}

impl RefreshHandle {
    /// Spawns the background task
    ///
    /// The first cycle runs immediately; later ones follow the interval.
    /// Ticks missed while a cycle is running are delayed, never bursted.
    ///
    /// # Arguments
    /// * `coordinator` - Coordinator moved into the task
    /// * `ctx` - Location monitored by every cycle
    /// * `config` - Schedule settings
    pub fn spawn(
        mut coordinator: SyncCoordinator,
        ctx: LocationContext,
        config: RefreshConfig,
    ) -> Self {
        let (msg_tx, msg_rx) = mpsc::channel(REPORT_CAPACITY);
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<()>(1);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(config.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    Some(()) = trigger_rx.recv() => {}
                    _ = shutdown_rx.recv() => break,
                }

                report(&msg_tx, SyncMessage::CycleStarted);
                let message = match coordinator.check_and_update(&ctx).await {
                    Ok(synced) => {
                        info!(
                            status = %synced.status,
                            rows = synced.dataset.row_count(),
                            "Sync cycle completed"
                        );
                        SyncMessage::CycleCompleted(synced)
                    }
                    Err(e) => {
                        error!(error = %e, "Sync cycle failed");
                        SyncMessage::CycleFailed(e.to_string())
                    }
                };
                report(&msg_tx, message);
            }

            coordinator
        });

        Self {
            receiver: msg_rx,
            trigger_tx,
            shutdown_tx,
            task,
        }
    }

    /// Requests a cycle now instead of waiting for the next tick
    ///
    /// A request made while one is already pending is dropped.
    pub fn request_refresh(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Stops the background task after the current cycle
    ///
    /// # Returns
    /// The coordinator, or `None` if the task panicked
    pub async fn shutdown(self) -> Option<SyncCoordinator> {
        let _ = self.shutdown_tx.send(()).await;
        self.task.await.ok()
    }
}

/// Sends a report without waiting for room in the channel
fn report(tx: &mpsc::Sender<SyncMessage>, message: SyncMessage) {
    if let Err(e) = tx.try_send(message) {
        debug!(error = %e, "Dropped cycle report");
    }
}

/// Checks for pending cycle reports without blocking
///
/// # Returns
/// * `Some(SyncMessage)` if a message was available
/// * `None` if no messages are pending
pub fn try_recv(handle: &mut RefreshHandle) -> Option<SyncMessage> {
    handle.receiver.try_recv().ok()
}
