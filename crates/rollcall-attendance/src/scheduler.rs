//! Sync scheduler: pushes locally pending attendance to the remote mirror.
//!
//! Each record is written independently; one failing record never blocks
//! its siblings. A batch that cannot even be read is retried with backoff a
//! bounded number of times and then deferred to the next cycle. Pending
//! records are never dropped.

use crate::clock::Clock;
use crate::record::SyncStatus;
use crate::remote::{put_with_timeout, RemoteStore};
use crate::retry::{retry_with_backoff, RetryPolicy};
use crate::store::{LocalStore, StoreError};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Default number of pending records pushed per flush.
pub const DEFAULT_BATCH_LIMIT: usize = 50;

/// Shortest period between scheduled cycles.
pub const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("sync batch failed: {0}")]
    Store(#[from] StoreError),
    #[error("sync cycle gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: StoreError,
    },
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub batch_limit: usize,
    /// Upper bound on each remote write.
    pub remote_timeout: Duration,
    /// Retry policy for a whole batch whose local read failed.
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_BATCH_LIMIT,
            remote_timeout: Duration::from_secs(15),
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one flush.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub attempted: usize,
    pub synced: usize,
    pub failed: usize,
}

pub struct SyncScheduler {
    store: Arc<dyn LocalStore>,
    remote: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    options: SyncOptions,
}

impl SyncScheduler {
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            remote,
            clock,
            options,
        }
    }

    /// Push up to `batch_limit` pending records, oldest first.
    ///
    /// Only a failure to read the batch is an error; per-record failures are
    /// counted in the report and leave the record pending.
    pub async fn flush_pending(&self, batch_limit: usize) -> Result<FlushReport, SyncError> {
        let pending = self.store.pending(batch_limit).await?;
        let mut report = FlushReport {
            attempted: pending.len(),
            ..Default::default()
        };

        for record in &pending {
            let path = record.remote_path();
            let value = record.to_remote_value();

            if let Err(e) =
                put_with_timeout(self.remote.as_ref(), &path, &value, self.options.remote_timeout).await
            {
                tracing::warn!(record_id = %record.id, path = %path, error = %e, "remote write failed; record stays pending");
                report.failed += 1;
                continue;
            }

            match self.store.update_sync_status(&record.id, SyncStatus::Synced).await {
                Ok(_) => {
                    tracing::debug!(record_id = %record.id, path = %path, "record synced");
                    report.synced += 1;
                }
                Err(e) => {
                    // The remote write is idempotent, so the next flush simply repeats it.
                    tracing::warn!(record_id = %record.id, error = %e, "failed to mark record synced");
                    report.failed += 1;
                }
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                synced = report.synced,
                failed = report.failed,
                "flushed pending attendance"
            );
        }
        Ok(report)
    }

    /// One scheduling cycle: flush with the configured batch limit, retrying
    /// batch-level failures per the retry policy.
    pub async fn run_cycle(&self) -> Result<FlushReport, SyncError> {
        let policy = &self.options.retry;
        let this = self;
        retry_with_backoff(policy, "sync cycle", || async move {
            match this.flush_pending(this.options.batch_limit).await {
                Ok(report) => Ok(report),
                Err(SyncError::Store(e)) | Err(SyncError::Exhausted { last: e, .. }) => Err(e),
            }
        })
        .await
        .map_err(|last| SyncError::Exhausted {
            attempts: policy.attempts(),
            last,
        })
    }

    /// Delete synced records older than `retention`. Returns how many were removed.
    pub async fn sweep_expired(&self, retention: Duration) -> Result<usize, SyncError> {
        let now = self.clock.now().with_timezone(&Utc);
        let Some(cutoff) = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|r| now.checked_sub_signed(r))
        else {
            return Ok(0);
        };

        let deleted = self.store.delete_synced_before(cutoff).await?;
        if deleted > 0 {
            tracing::info!(deleted, %cutoff, "retention sweep removed synced records");
        }
        Ok(deleted)
    }

    /// Run cycles every `interval` (and on [`SyncHandle::trigger`]) until shut down.
    ///
    /// The first cycle starts immediately. If `retention` is set, a sweep
    /// follows every cycle. Intervals below [`MIN_SYNC_INTERVAL`] are raised to it.
    pub fn spawn(self: Arc<Self>, interval: Duration, retention: Option<Duration>) -> SyncHandle {
        if interval < MIN_SYNC_INTERVAL {
            tracing::warn!(
                requested_ms = interval.as_millis() as u64,
                "sync interval too short; using minimum"
            );
        }
        let interval = interval.max(MIN_SYNC_INTERVAL);
        let trigger = Arc::new(Notify::new());
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let notified = trigger.clone();

        let task = tokio::spawn(async move {
            tracing::info!(interval_secs = interval.as_secs(), "sync job started");
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = notified.notified() => tracing::debug!("sync triggered"),
                    _ = shutdown_rx.changed() => break,
                }

                tokio::select! {
                    result = self.run_cycle() => match result {
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "sync cycle failed; pending records deferred to next cycle"),
                    },
                    _ = shutdown_rx.changed() => {
                        tracing::info!("shutdown during sync; in-flight writes abandoned");
                        break;
                    }
                }

                if let Some(retention) = retention {
                    if let Err(e) = self.sweep_expired(retention).await {
                        tracing::warn!(error = %e, "retention sweep failed");
                    }
                }
            }
            tracing::info!("sync job stopped");
        });

        SyncHandle {
            trigger,
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Control handle for a spawned sync job.
pub struct SyncHandle {
    trigger: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Run a cycle now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Stop the job and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "sync job task failed");
        }
    }
}
