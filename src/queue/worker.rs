//! Background queue processor driven by connectivity and a timer

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use super::OfflineQueue;
use crate::error::{Result, SyncError};

/// Commands for the queue worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueCommand {
    /// Process now if online
    Process,
    /// Connectivity changed; regaining it triggers a run
    ConnectivityChanged(bool),
    /// Stop the worker
    Stop,
}

/// Background queue worker
pub struct QueueWorker {
    sender: mpsc::Sender<QueueCommand>,
    handle: JoinHandle<()>,
}

impl QueueWorker {
    /// Start the worker; `online` is the connectivity known at start
    pub fn start(queue: Arc<OfflineQueue>, period: Duration, online: bool) -> Self {
        let (sender, mut receiver) = mpsc::channel::<QueueCommand>(64);

        let handle = tokio::spawn(async move {
            let mut online = online;
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(QueueCommand::Process) => {
                                if online {
                                    Self::run(&queue).await;
                                }
                            }
                            Some(QueueCommand::ConnectivityChanged(now_online)) => {
                                let regained = now_online && !online;
                                online = now_online;
                                if regained {
                                    tracing::info!("Connectivity regained, replaying offline queue");
                                    Self::run(&queue).await;
                                }
                            }
                            Some(QueueCommand::Stop) | None => {
                                queue.cancel();
                                break;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        if online {
                            Self::run(&queue).await;
                        }
                    }
                }
            }

            tracing::info!("Queue worker stopped");
        });

        Self { sender, handle }
    }

    async fn run(queue: &OfflineQueue) {
        if let Err(e) = queue.process_queue().await {
            tracing::error!("Offline queue run failed: {}", e);
        }
    }

    async fn send(&self, cmd: QueueCommand) -> Result<()> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SyncError::Internal("Queue worker channel closed".to_string()))
    }

    pub async fn process(&self) -> Result<()> {
        self.send(QueueCommand::Process).await
    }

    pub async fn set_online(&self, online: bool) -> Result<()> {
        self.send(QueueCommand::ConnectivityChanged(online)).await
    }

    /// Stop the worker and wait for it to exit
    pub async fn stop(self) -> Result<()> {
        // A closed channel means the loop already ended
        let _ = self.sender.send(QueueCommand::Stop).await;
        self.handle
            .await
            .map_err(|e| SyncError::Internal(format!("Queue worker panicked: {}", e)))
    }
}
