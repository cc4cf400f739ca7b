/*!
Snapshot-wrapped storage.

[`SnapshotStorage`] decorates any engine and mirrors its full state into a
[`SnapshotFile`]. With a zero flush interval every mutation is followed by
a synchronous save; with a positive interval a background task saves on
that cadence. Mutations and saves serialize on one async gate, so a
snapshot always reflects a state between two complete writes.
*/

use super::MetricStorage;
use crate::metric::{Metric, MetricKind};
use crate::observability::record_snapshot;
use crate::snapshot::SnapshotFile;
use crate::{Result, TallyError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot configuration
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    /// Snapshot file; `None` (or an empty path) disables persistence
    pub path: Option<PathBuf>,
    /// Zero means save after every mutation
    pub flush_interval: Duration,
    /// Replay the existing snapshot into the engine on open
    pub restore: bool,
}

impl SnapshotOptions {
    fn file(&self) -> Option<SnapshotFile> {
        self.path
            .as_ref()
            .filter(|p| !p.as_os_str().is_empty())
            .map(SnapshotFile::new)
    }
}

struct Shared<S> {
    inner: S,
    file: Option<SnapshotFile>,
    sync_writes: bool,
    gate: tokio::sync::Mutex<()>,
}

impl<S: MetricStorage> Shared<S> {
    /// Write the current state; the caller must hold the gate
    async fn save_locked(&self, file: &SnapshotFile) -> Result<()> {
        let metrics = self.inner.list().await?;
        let count = metrics.len();
        let file = file.clone();

        let result = tokio::task::spawn_blocking(move || file.save(&metrics))
            .await
            .map_err(|e| TallyError::storage(format!("snapshot task failed: {e}")))
            .and_then(|saved| saved);

        record_snapshot(result.is_ok());
        if result.is_ok() {
            debug!(metrics = count, "Snapshot written");
        }
        result
    }

    async fn save(&self) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let _gate = self.gate.lock().await;
        self.save_locked(file).await
    }

    /// Apply a mutation under the gate, then save when writes are synchronous
    async fn mutate<'a, F, Fut>(&'a self, apply: F) -> Result<()>
    where
        F: FnOnce(&'a S) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let Some(file) = &self.file else {
            return apply(&self.inner).await;
        };

        let _gate = self.gate.lock().await;
        apply(&self.inner).await?;
        if self.sync_writes {
            if let Err(e) = self.save_locked(file).await {
                error!(path = %file.path().display(), error = %e, "Failed to write snapshot");
            }
        }
        Ok(())
    }
}

/// Storage decorator that persists its inner engine to a snapshot file
///
/// # Example
/// ```rust,no_run
/// use std::time::Duration;
/// use tally_core::storage::{MemStorage, SnapshotOptions, SnapshotStorage};
///
/// # async fn run() -> tally_core::Result<()> {
/// let options = SnapshotOptions {
///     path: Some("/var/lib/tally/metrics.json".into()),
///     flush_interval: Duration::from_secs(300),
///     restore: true,
/// };
/// let storage = SnapshotStorage::open(MemStorage::new(), options).await?;
/// // ... serve requests ...
/// storage.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SnapshotStorage<S> {
    shared: Arc<Shared<S>>,
    stop: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl<S: MetricStorage + 'static> SnapshotStorage<S> {
    /// Wrap `inner`, restoring and scheduling saves as `options` require
    ///
    /// # Errors
    /// Only fails if replaying a readable snapshot into `inner` fails. A
    /// missing or corrupt snapshot file is logged and the engine starts empty.
    pub async fn open(inner: S, options: SnapshotOptions) -> Result<Self> {
        let file = options.file();

        if let (Some(file), true) = (&file, options.restore) {
            restore(&inner, file).await?;
        }

        let shared = Arc::new(Shared {
            inner,
            file,
            sync_writes: options.flush_interval.is_zero(),
            gate: tokio::sync::Mutex::new(()),
        });
        let stop = CancellationToken::new();

        let flusher = match &shared.file {
            Some(file) if !options.flush_interval.is_zero() => {
                info!(
                    path = %file.path().display(),
                    interval_ms = options.flush_interval.as_millis() as u64,
                    "Periodic snapshots enabled"
                );
                Some(tokio::spawn(run_flusher(
                    Arc::clone(&shared),
                    options.flush_interval,
                    stop.clone(),
                )))
            }
            Some(file) => {
                info!(path = %file.path().display(), "Synchronous snapshots enabled");
                None
            }
            None => None,
        };

        Ok(Self {
            shared,
            stop,
            flusher: Mutex::new(flusher),
        })
    }

    pub fn inner(&self) -> &S {
        &self.shared.inner
    }

    /// Whether a snapshot file is configured
    pub fn is_active(&self) -> bool {
        self.shared.file.is_some()
    }

    /// Write a snapshot now, regardless of the flush interval
    pub async fn save(&self) -> Result<()> {
        self.shared.save().await
    }

    /// Stop periodic saves and write one final snapshot
    ///
    /// Safe to call more than once. A failing final save is logged.
    pub async fn shutdown(&self) {
        self.stop.cancel();
        let flusher = self
            .flusher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = flusher {
            if let Err(e) = handle.await {
                warn!(error = %e, "Snapshot task ended abnormally");
            }
        }

        if let Some(file) = &self.shared.file {
            match self.shared.save().await {
                Ok(()) => info!(path = %file.path().display(), "Final snapshot written"),
                Err(e) => {
                    error!(path = %file.path().display(), error = %e, "Failed to write final snapshot")
                }
            }
        }
    }
}

impl<S> Drop for SnapshotStorage<S> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn restore<S: MetricStorage>(inner: &S, file: &SnapshotFile) -> Result<()> {
    let reader = file.clone();
    let loaded = tokio::task::spawn_blocking(move || reader.load())
        .await
        .map_err(|e| TallyError::storage(format!("snapshot task failed: {e}")))?;

    match loaded {
        Ok(Some(metrics)) => {
            inner.bulk_add(&metrics).await?;
            info!(
                path = %file.path().display(),
                metrics = metrics.len(),
                "Restored metrics from snapshot"
            );
        }
        Ok(None) => {
            info!(path = %file.path().display(), "No snapshot found, starting empty");
        }
        Err(e) => {
            warn!(
                path = %file.path().display(),
                error = %e,
                "Snapshot is unreadable, starting empty"
            );
        }
    }
    Ok(())
}

async fn run_flusher<S: MetricStorage>(
    shared: Arc<Shared<S>>,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = shared.save().await {
                    error!(error = %e, "Failed to write periodic snapshot");
                }
            }
        }
    }
    debug!("Snapshot task stopped");
}

#[async_trait]
impl<S: MetricStorage + 'static> MetricStorage for SnapshotStorage<S> {
    async fn add(&self, metric: Metric) -> Result<()> {
        self.shared.mutate(|inner| inner.add(metric)).await
    }

    async fn get(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        self.shared.inner.get(kind, id).await
    }

    async fn list(&self) -> Result<Vec<Metric>> {
        self.shared.inner.list().await
    }

    async fn bulk_add(&self, batch: &[Metric]) -> Result<()> {
        self.shared.mutate(|inner| inner.bulk_add(batch)).await
    }

    async fn ping(&self) -> bool {
        self.shared.inner.ping().await
    }
}
