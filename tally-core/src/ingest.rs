/*!
Ingestion service shared by the HTTP and RPC front doors.

Batches are validated in full before anything is stored, then merged in
chunks of [`CHUNK_SIZE`] records. Chunks are applied in order and the first
failing chunk stops the request; chunks merged before it stay merged.
*/

use crate::metric::{Metric, MetricKind, MetricRecord};
use crate::storage::MetricStorage;
use crate::{Result, TallyError};
use std::sync::Arc;
use tracing::{debug, error};

/// Maximum number of records merged by one `bulk_add` call
pub const CHUNK_SIZE: usize = 100;

/// Validating front end to a storage engine
///
/// # Example
/// ```rust
/// use std::sync::Arc;
/// use tally_core::{IngestService, MemStorage, Metric};
///
/// # tokio_test_block(async {
/// let ingest = IngestService::new(Arc::new(MemStorage::new()));
/// ingest.update_batch(vec![Metric::counter("PollCount", 1)]).await?;
/// assert_eq!(ingest.list().await?.len(), 1);
/// # Ok::<(), tally_core::TallyError>(())
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
/// # }
/// ```
#[derive(Clone)]
pub struct IngestService {
    storage: Arc<dyn MetricStorage>,
}

impl IngestService {
    pub fn new(storage: Arc<dyn MetricStorage>) -> Self {
        Self { storage }
    }

    /// Build a metric from path-encoded parts
    pub fn parse(kind: &str, id: &str, raw: &str) -> Result<Metric> {
        Metric::parse(kind, id, raw)
    }

    /// Merge one already-validated metric
    pub async fn update(&self, metric: Metric) -> Result<()> {
        self.storage.add(metric).await
    }

    /// Validate and merge one JSON record, returning the stored state
    pub async fn update_record(&self, record: MetricRecord) -> Result<Metric> {
        let metric = Metric::try_from(record)?;
        let (kind, id) = (metric.kind(), metric.id.clone());
        self.storage.add(metric).await?;
        self.storage.get(kind, &id).await
    }

    /// Validate every record, then merge them chunk by chunk
    pub async fn update_records(&self, records: Vec<MetricRecord>) -> Result<usize> {
        let metrics = records
            .into_iter()
            .map(Metric::try_from)
            .collect::<Result<Vec<_>>>()?;
        self.update_batch(metrics).await
    }

    /// Merge a batch in sequential chunks of [`CHUNK_SIZE`]
    ///
    /// # Returns
    /// The number of records merged.
    ///
    /// # Errors
    /// `TallyError::Storage` naming the failing chunk. Earlier chunks remain
    /// applied and later chunks are never attempted.
    pub async fn update_batch(&self, metrics: Vec<Metric>) -> Result<usize> {
        for (index, chunk) in metrics.chunks(CHUNK_SIZE).enumerate() {
            if let Err(e) = self.storage.bulk_add(chunk).await {
                error!(chunk = index, records = chunk.len(), error = %e, "Failed to store metric chunk");
                return Err(TallyError::storage(format!(
                    "failed to store chunk {index} ({} records): {e}",
                    chunk.len()
                )));
            }
        }
        debug!(records = metrics.len(), "Stored metric batch");
        Ok(metrics.len())
    }

    pub async fn value(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        self.storage.get(kind, id).await
    }

    pub async fn list(&self) -> Result<Vec<Metric>> {
        self.storage.list().await
    }

    pub async fn ping(&self) -> bool {
        self.storage.ping().await
    }
}
