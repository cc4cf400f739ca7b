/*!
Metric storage engines.

This module defines the storage abstraction (port) and its implementations
(adapters): an in-memory engine, a Postgres-backed engine and a decorator
that mirrors any engine into a snapshot file. Ingestion and the agent's
local buffer only ever talk to the [`MetricStorage`] trait.
*/

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod snapshot;

use crate::metric::{Metric, MetricKind};
use crate::Result;
use async_trait::async_trait;

/// Storage abstraction for gauge and counter metrics
///
/// Every implementation must be safe under unlimited concurrent callers and
/// apply the kind-specific merge rules: gauges are overwritten in the order
/// writes are applied, counters accumulate the sum of all deltas.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MetricStorage: Send + Sync {
    /// Merge a single metric into storage
    async fn add(&self, metric: Metric) -> Result<()>;

    /// Look up the current value of `id` under `kind`
    ///
    /// # Errors
    /// `TallyError::NotFound` if the id was never stored under that kind. A
    /// gauge and a counter with the same id are different metrics.
    async fn get(&self, kind: MetricKind, id: &str) -> Result<Metric>;

    /// Point-in-time copy of every stored metric, in no particular order
    async fn list(&self) -> Result<Vec<Metric>>;

    /// Merge every metric of `batch`
    ///
    /// Not transactional across calls: on failure, records applied before the
    /// failing one may remain applied.
    async fn bulk_add(&self, batch: &[Metric]) -> Result<()>;

    /// Liveness probe; remote backends perform a round trip
    async fn ping(&self) -> bool;
}

#[async_trait]
impl<T: MetricStorage + ?Sized> MetricStorage for std::sync::Arc<T> {
    async fn add(&self, metric: Metric) -> Result<()> {
        (**self).add(metric).await
    }

    async fn get(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        (**self).get(kind, id).await
    }

    async fn list(&self) -> Result<Vec<Metric>> {
        (**self).list().await
    }

    async fn bulk_add(&self, batch: &[Metric]) -> Result<()> {
        (**self).bulk_add(batch).await
    }

    async fn ping(&self) -> bool {
        (**self).ping().await
    }
}

// Re-export types for convenience
pub use memory::MemStorage;
#[cfg(feature = "postgres")]
pub use postgres::PgStorage;
pub use snapshot::{SnapshotOptions, SnapshotStorage};
