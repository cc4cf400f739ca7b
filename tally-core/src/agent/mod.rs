/*!
The metrics agent: a collector feeding a local buffer that a pool of
delivery workers drains to the server.
*/

pub mod collector;
pub mod delivery;
pub mod transport;

pub use collector::Collector;
pub use delivery::DeliveryPool;
pub use transport::{HttpTransport, MetricsTransport, RpcTransport};

use crate::config::{AgentConfig, TransportKind};
use crate::signing::BodySigner;
use crate::storage::MemStorage;
use crate::Result;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Build the transport selected by `config`
pub async fn build_transport(config: &AgentConfig) -> Result<Arc<dyn MetricsTransport>> {
    let transport: Arc<dyn MetricsTransport> = match config.transport {
        TransportKind::Http => Arc::new(
            HttpTransport::new(
                &config.address,
                config.compress_request,
                BodySigner::from_key(config.key.as_deref()),
                config.request_timeout,
            )
            .await?,
        ),
        TransportKind::Rpc => Arc::new(RpcTransport::new(&config.address, config.request_timeout)),
    };
    Ok(transport)
}

/// Run the agent until `cancel` fires, then wait for its tasks
///
/// Tasks still running after the shutdown grace period are aborted.
pub async fn run_agent(config: AgentConfig, cancel: CancellationToken) -> Result<()> {
    config.validate()?;
    let transport = build_transport(&config).await?;
    info!(
        server = %config.address,
        transport = transport.name(),
        "Starting agent"
    );

    let buffer = Arc::new(MemStorage::new());
    let mut tasks = JoinSet::new();

    let collector = Collector::new(Arc::clone(&buffer));
    tasks.spawn(collector.run(config.poll_interval, cancel.clone()));

    DeliveryPool::new(
        buffer,
        transport,
        config.backoff_policy(),
        config.report_interval,
        config.rate_limit,
    )
    .spawn(&mut tasks, &cancel);

    cancel.cancelled().await;
    info!("Agent shutting down");

    let drained = tokio::time::timeout(config.shutdown_grace, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            grace_ms = config.shutdown_grace.as_millis() as u64,
            remaining = tasks.len(),
            "Agent tasks did not stop in time, aborting"
        );
        tasks.shutdown().await;
    }

    info!("Agent stopped");
    Ok(())
}
