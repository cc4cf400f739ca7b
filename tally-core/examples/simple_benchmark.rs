/*!
Simple benchmark example for hyperfine performance testing.

Ingests a batch of gauges and counters, then writes and reloads a snapshot.
*/

use std::sync::Arc;
use std::time::Instant;
use tally_core::{IngestService, MemStorage, Metric, SnapshotFile};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let storage = Arc::new(MemStorage::new());
    let ingest = IngestService::new(storage.clone());
    let temp_dir = tempfile::TempDir::new().unwrap();

    let batch: Vec<Metric> = (0..5_000)
        .map(|i| {
            if i % 2 == 0 {
                Metric::gauge(format!("gauge_{i}"), i as f64 * 0.5)
            } else {
                Metric::counter(format!("counter_{i}"), i)
            }
        })
        .collect();

    let start = Instant::now();
    let stored = ingest.update_batch(batch).await.unwrap();
    let ingest_time = start.elapsed();

    let file = SnapshotFile::new(temp_dir.path().join("metrics.json"));
    let start = Instant::now();
    let metrics = storage.snapshot();
    file.save(&metrics).unwrap();
    let restored = file.load().unwrap().unwrap_or_default();
    let snapshot_time = start.elapsed();

    assert_eq!(restored.len(), stored);

    println!("Ingested {stored} metrics in: {ingest_time:?}");
    println!("Snapshot round trip completed in: {snapshot_time:?}");
    println!(
        "Snapshot size: {} bytes",
        std::fs::metadata(file.path()).unwrap().len()
    );
}
