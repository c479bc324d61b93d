use anyhow::Result;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

/// Fans a single shutdown signal out to every background loop.
pub struct ShutdownCoordinator {
    sender: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    grace: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        let (sender, _) = watch::channel(false);
        Self {
            sender,
            tasks: Vec::new(),
            grace,
        }
    }

    /// Receiver that flips to `true` once shutdown starts.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }

    /// Tracks a background task so shutdown waits for it.
    pub fn track(&mut self, handle: JoinHandle<()>) {
        self.tasks.push(handle);
    }

    pub fn track_all(&mut self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks.extend(handles);
    }

    pub fn trigger(&self) {
        self.sender.send_replace(true);
    }

    /// Waits for Ctrl-C, then shuts down.
    pub async fn wait_for_shutdown(self) -> Result<()> {
        info!("Shutdown coordinator ready - will shutdown gracefully on Ctrl-C");
        tokio::signal::ctrl_c().await?;
        info!("Shutdown signal received");
        self.shutdown_all_services().await
    }

    /// Signals every loop and waits up to the grace period for them to exit.
    pub async fn shutdown_all_services(self) -> Result<()> {
        info!(tasks = self.tasks.len(), "Initiating graceful shutdown of all services...");
        self.trigger();

        let tasks = self.tasks;
        let drained = timeout(self.grace, async {
            for task in tasks {
                if let Err(e) = task.await {
                    warn!(error = %e, "Background task ended abnormally");
                }
            }
        })
        .await;

        match drained {
            Ok(()) => info!("Graceful shutdown completed successfully"),
            Err(_) => warn!(grace_ms = self.grace.as_millis() as u64, "Timed out waiting for background tasks"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shutdown_reaches_every_subscriber() {
        let mut coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        for _ in 0..3 {
            let mut rx = coordinator.subscribe();
            coordinator.track(tokio::spawn(async move {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            }));
        }

        coordinator.shutdown_all_services().await.unwrap();
    }
}
