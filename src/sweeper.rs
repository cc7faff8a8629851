//! Background retention sweep
//!
//! One task per process: sleep for `interval`, delete artifacts older than
//! `max_age`, repeat until shutdown. Errors inside a sweep are logged by the
//! store and never end the loop.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::store::{ArtifactStore, SweepReport};

/// Sweep schedule and age threshold
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Pause between two sweeps
    pub interval: Duration,
    /// Artifacts strictly older than this are deleted
    pub max_age: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            max_age: Duration::from_secs(3600),
        }
    }
}

pub struct RetentionSweeper {
    store: ArtifactStore,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: ArtifactStore, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> RetentionConfig {
        self.config
    }

    /// Run a single sweep and log its outcome
    pub async fn sweep_once(&self) -> SweepReport {
        let report = self.store.sweep(self.config.max_age).await;
        if !report.failures.is_empty() {
            warn!(
                scanned = report.scanned,
                deleted = report.deleted,
                failures = report.failures.len(),
                "retention sweep finished with failures"
            );
        } else if report.deleted > 0 {
            info!(
                scanned = report.scanned,
                deleted = report.deleted,
                "retention sweep removed expired artifacts"
            );
        } else {
            debug!(scanned = report.scanned, "retention sweep found nothing to delete");
        }
        report
    }

    /// Sweep every `interval` until `shutdown` resolves
    pub async fn run_until<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        info!(
            interval_secs = self.config.interval.as_secs(),
            max_age_secs = self.config.max_age.as_secs(),
            dir = %self.store.root().display(),
            "retention sweeper started"
        );
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = tokio::time::sleep(self.config.interval) => {
                    self.sweep_once().await;
                }
            }
        }
        info!("retention sweeper stopped");
    }

    /// Start the sweep loop as a background task
    pub fn spawn<F>(self, shutdown: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(self.run_until(shutdown))
    }
}
