/*!
Delivery worker pool.

Every worker independently snapshots the agent's buffer, sends it through
the transport under the backoff policy, logs a final failure and waits for
the report interval. Workers share nothing but the buffer and transport, so
the worker count bounds the number of concurrent outbound requests.

Delivery is at-least-once: the same cumulative counter values may be sent
by several workers and by retries of a request the server already applied.
*/

use super::transport::MetricsTransport;
use crate::observability::record_delivery;
use crate::storage::MetricStorage;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tally_retry::{with_retryable_backoff, BackoffPolicy};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A pool of delivery workers sharing one buffer and transport
#[derive(Clone)]
pub struct DeliveryPool {
    buffer: Arc<dyn MetricStorage>,
    transport: Arc<dyn MetricsTransport>,
    policy: BackoffPolicy,
    report_interval: Duration,
    workers: usize,
}

impl DeliveryPool {
    pub fn new(
        buffer: Arc<dyn MetricStorage>,
        transport: Arc<dyn MetricsTransport>,
        policy: BackoffPolicy,
        report_interval: Duration,
        workers: usize,
    ) -> Self {
        Self {
            buffer,
            transport,
            policy,
            report_interval,
            workers: workers.max(1),
        }
    }

    /// Snapshot the buffer and send it, retrying transient failures
    ///
    /// # Returns
    /// The number of metrics delivered; zero when the buffer was empty and
    /// no request was made.
    pub async fn deliver_once(&self) -> Result<usize> {
        let batch = self.buffer.list().await?;
        if batch.is_empty() {
            debug!("Buffer is empty, nothing to deliver");
            return Ok(0);
        }

        let result = with_retryable_backoff("send_metrics", &self.policy, |_attempt| {
            self.transport.send_metrics(&batch)
        })
        .await;
        record_delivery(result.is_ok());
        result.map(|_| batch.len())
    }

    async fn run_worker(self, worker: usize, cancel: CancellationToken) {
        debug!(worker, transport = self.transport.name(), "Delivery worker started");
        while !cancel.is_cancelled() {
            match self.deliver_once().await {
                Ok(0) => {}
                Ok(count) => debug!(worker, metrics = count, "Metrics delivered"),
                Err(e) => error!(worker, error = %e, "Failed to deliver metrics"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.report_interval) => {}
            }
        }
        debug!(worker, "Delivery worker stopped");
    }

    /// Start every worker on `tasks`; they exit once `cancel` fires
    pub fn spawn(&self, tasks: &mut JoinSet<()>, cancel: &CancellationToken) {
        info!(
            workers = self.workers,
            transport = self.transport.name(),
            report_interval_ms = self.report_interval.as_millis() as u64,
            "Starting delivery workers"
        );
        for worker in 0..self.workers {
            tasks.spawn(self.clone().run_worker(worker, cancel.clone()));
        }
    }
}
