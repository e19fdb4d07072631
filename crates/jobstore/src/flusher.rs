//! Debounced background flushing.
//!
//! Mutations only mark the store dirty. The scheduler waits for a change,
//! lets further changes accumulate for the write delay, then flushes on the
//! blocking pool. A failed flush leaves the store dirty; I/O failures are
//! retried after another delay.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::JobStoreError;
use crate::store::{FlushOutcome, JobStore};

/// Run one flush on the blocking pool.
pub async fn flush_async(store: Arc<JobStore>) -> Result<FlushOutcome, JobStoreError> {
    tokio::task::spawn_blocking(move || store.flush())
        .await
        .map_err(|e| JobStoreError::Io(std::io::Error::other(e)))?
}

/// Background task that keeps the disk in step with the store.
pub struct FlushScheduler;

impl FlushScheduler {
    /// Spawn the flush loop. It stops when `cancel` fires, flushing once
    /// more if the store is configured to flush on shutdown.
    pub fn spawn(store: Arc<JobStore>, delay: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(Self::run(store, delay, cancel))
    }

    async fn run(store: Arc<JobStore>, delay: Duration, cancel: CancellationToken) {
        let mut changes = store.subscribe();
        // Pick up changes made before we subscribed.
        let mut retry = store.is_dirty();

        info!("Starting flush scheduler (delay: {:?})", delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = changes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(delay), if retry => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            changes.borrow_and_update();

            retry = should_retry(&flush_async(store.clone()).await);
        }

        if store.config().flush_on_shutdown && store.is_dirty() {
            match flush_async(store.clone()).await {
                Ok(outcome) => debug!("Final flush: {:?}", outcome),
                Err(e) => warn!("Final flush failed: {}", e),
            }
        }
        info!("Flush scheduler stopped");
    }
}

/// Log a background flush result and decide whether to try again after
/// another delay. Errors that a retry cannot fix wait for the next change.
fn should_retry(result: &Result<FlushOutcome, JobStoreError>) -> bool {
    match result {
        Ok(outcome) => {
            debug!("Background flush: {:?}", outcome);
            false
        }
        Err(e) if e.is_retryable() => {
            warn!("Background flush failed, will retry: {}", e);
            true
        }
        Err(e) => {
            warn!("Background flush failed, not retrying: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::JobRecord;
    use jobstore_config::StoreConfig;
    use tempfile::TempDir;

    fn open(config: StoreConfig) -> Arc<JobStore> {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000, 1_000, true));
        Arc::new(JobStore::open(config, clock).unwrap().0)
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_change_is_flushed_after_delay() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::with_storage_dir(temp_dir.path()).with_write_delay(Duration::from_millis(20));
        let store = open(config);
        let cancel = CancellationToken::new();
        let handle = FlushScheduler::spawn(store.clone(), store.config().write_delay(), cancel.clone());

        for id in 0..20 {
            store.add(JobRecord::new("app", 0, id).with_persisted(true)).unwrap();
        }

        wait_for(|| store.flush_count() == 1).await;
        assert!(!store.is_dirty());
        assert!(temp_dir.path().join("jobs.bin").exists());

        // The burst was coalesced into a single write.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.flush_count(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_flushes_pending_changes() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::with_storage_dir(temp_dir.path()).with_write_delay(Duration::from_secs(3600));
        let store = open(config);
        let cancel = CancellationToken::new();
        let handle = FlushScheduler::spawn(store.clone(), store.config().write_delay(), cancel.clone());

        store.add(JobRecord::new("app", 0, 1).with_persisted(true)).unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.flush_count(), 1);
        assert!(!store.is_dirty());
    }

    #[tokio::test]
    async fn test_shutdown_without_final_flush() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = StoreConfig::with_storage_dir(temp_dir.path()).with_write_delay(Duration::from_secs(3600));
        config.flush_on_shutdown = false;
        let store = open(config);
        let cancel = CancellationToken::new();
        let handle = FlushScheduler::spawn(store.clone(), store.config().write_delay(), cancel.clone());

        store.add(JobRecord::new("app", 0, 1).with_persisted(true)).unwrap();
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(store.flush_count(), 0);
        assert!(store.is_dirty());
    }

    #[test]
    fn test_only_transient_failures_are_retried() {
        assert!(!should_retry(&Ok(FlushOutcome::Clean)));
        assert!(should_retry(&Err(JobStoreError::Io(std::io::Error::other("disk full")))));
        assert!(!should_retry(&Err(JobStoreError::Validation(
            "too many records for one file".to_string()
        ))));
    }

    #[tokio::test]
    async fn test_unencodable_job_does_not_block_background_flush() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::with_storage_dir(temp_dir.path()).with_write_delay(Duration::from_millis(20));
        let store = open(config);
        let cancel = CancellationToken::new();
        let handle = FlushScheduler::spawn(store.clone(), store.config().write_delay(), cancel.clone());

        store.add(JobRecord::new("app", 0, 1).with_persisted(true)).unwrap();
        store
            .maintenance()
            .insert_unchecked(JobRecord::new("app", 0, 2).with_persisted(true).with_tag("x".repeat(70_000)));

        wait_for(|| store.flush_count() == 1).await;
        assert!(!store.is_dirty());
        assert_eq!(store.read_from_disk(true).unwrap().0.len(), 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_flush_async_on_clean_store() {
        let temp_dir = TempDir::new().unwrap();
        let store = open(StoreConfig::with_storage_dir(temp_dir.path()));
        assert_eq!(flush_async(store.clone()).await.unwrap(), FlushOutcome::Clean);
    }
}
