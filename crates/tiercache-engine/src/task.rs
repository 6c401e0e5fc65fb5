//! Handles for the engine's periodic background loops.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::info;

/// A spawned periodic loop that can be stopped.
#[derive(Debug)]
pub struct BackgroundTask {
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    /// Spawn `tick` every `period` until stopped. The first tick fires
    /// immediately.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            info!(task = name, period_secs = period.as_secs_f64(), "Background task started");

            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        tick().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!(task = name, "Background task shutting down");
                            break;
                        }
                    }
                }
            }
        });

        Self {
            name,
            shutdown_tx,
            handle,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            tracing::warn!(task = self.name, error = %e, "Background task ended abnormally");
        }
    }
}

/// The health, warming and expiry sweep loops started by
/// [`CacheEngine::start_background_tasks`](crate::CacheEngine::start_background_tasks).
#[derive(Debug)]
pub struct BackgroundTasks {
    pub health: BackgroundTask,
    pub warmer: BackgroundTask,
    pub sweeper: BackgroundTask,
}

impl BackgroundTasks {
    pub async fn shutdown(self) {
        tokio::join!(self.health.stop(), self.warmer.stop(), self.sweeper.stop());
    }
}
