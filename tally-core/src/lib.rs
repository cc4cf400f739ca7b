/*!
# Tally Core

Metric storage and reliable delivery.

This crate holds both halves of Tally:

- **Server side**: storage engines for gauges and counters (in-memory,
  Postgres, and a snapshot-file decorator over either), the ingest service
  and two front doors: JSON over HTTP and a length-delimited binary RPC.
- **Agent side**: a collector sampling runtime and host statistics into a
  local buffer and a pool of workers delivering that buffer with retries.

## Architecture

Storage is a port ([`MetricStorage`]) with pluggable adapters. The ingest
service, the HTTP and RPC front doors and the agent's buffer all talk to the
trait only, so the backend is chosen once at startup.

## Usage

```rust
use std::sync::Arc;
use tally_core::{IngestService, MemStorage, Metric, MetricKind, MetricValue};

# let rt = tokio::runtime::Builder::new_current_thread().build()?;
# rt.block_on(async {
let ingest = IngestService::new(Arc::new(MemStorage::new()));

ingest.update(Metric::counter("PollCount", 2)).await?;
ingest.update(Metric::counter("PollCount", 3)).await?;

let total = ingest.value(MetricKind::Counter, "PollCount").await?;
assert_eq!(total.value, MetricValue::Counter(5));
# Ok::<(), tally_core::TallyError>(())
# })?;
# Ok::<(), Box<dyn std::error::Error>>(())
```
*/

pub mod agent;
pub mod compression;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metric;
pub mod observability;
pub mod rpc;
pub mod server;
pub mod shutdown;
pub mod signing;
pub mod snapshot;
pub mod storage;
pub mod subnet;

pub use compression::{CompressionAdapter, GzipCompressor, NoCompression};
pub use config::{AgentConfig, ServerConfig, TransportKind};
pub use error::{Result, TallyError};
pub use ingest::{IngestService, CHUNK_SIZE};
pub use metric::{Metric, MetricKind, MetricRecord, MetricValue};
pub use signing::BodySigner;
pub use snapshot::SnapshotFile;
pub use storage::{MemStorage, MetricStorage, SnapshotOptions, SnapshotStorage};
pub use subnet::TrustedSubnet;

#[cfg(feature = "postgres")]
pub use storage::PgStorage;

#[cfg(test)]
mod metric_tests;
