/*!
Binary RPC front door.

One task per connection; each request is checked against the trusted
subnet using the connection's peer address, validated in full and then
ingested in chunks like an HTTP batch.
*/

use crate::ingest::IngestService;
use crate::metric::Metric;
use crate::observability::record_ingest;
use crate::rpc::{self, RpcRequest, RpcResponse};
use crate::subnet::TrustedSubnet;
use crate::{Result, TallyError};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serves the RPC protocol on a bound listener
#[derive(Clone)]
pub struct RpcServer {
    ingest: IngestService,
    subnet: TrustedSubnet,
}

impl RpcServer {
    pub fn new(ingest: IngestService, subnet: TrustedSubnet) -> Self {
        Self { ingest, subnet }
    }

    /// Answer one request from `peer`
    pub async fn handle(&self, peer: SocketAddr, request: RpcRequest) -> RpcResponse {
        match request {
            RpcRequest::UpdateMetrics(batch) => {
                let count = batch.len();
                let result = self.update_metrics(peer, batch).await;
                record_ingest("rpc", count, result.is_ok());
                match result {
                    Ok(()) => RpcResponse::Ok,
                    Err(e) => {
                        warn!(%peer, error = %e, "RPC update rejected");
                        RpcResponse::from_error(&e)
                    }
                }
            }
        }
    }

    async fn update_metrics(&self, peer: SocketAddr, batch: Vec<rpc::RpcMetric>) -> Result<()> {
        if !self.subnet.contains(peer.ip()) {
            return Err(TallyError::PermissionDenied(format!(
                "{} is outside the trusted subnet",
                peer.ip()
            )));
        }
        let metrics = batch
            .into_iter()
            .map(Metric::try_from)
            .collect::<Result<Vec<_>>>()?;
        self.ingest.update_batch(metrics).await?;
        Ok(())
    }

    async fn serve_connection(self, stream: TcpStream, peer: SocketAddr, cancel: CancellationToken) {
        debug!(%peer, "RPC connection opened");
        let mut framed = rpc::framed(stream);

        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => break,
                request = rpc::recv::<_, RpcRequest>(&mut framed) => request,
            };
            let response = match request {
                Ok(Some(request)) => self.handle(peer, request).await,
                Ok(None) => break,
                // undecodable frame; the stream itself is still aligned
                Err(e @ TallyError::Validation(_)) => RpcResponse::from_error(&e),
                Err(e) => {
                    debug!(%peer, error = %e, "RPC connection failed");
                    break;
                }
            };
            if let Err(e) = rpc::send(&mut framed, &response).await {
                debug!(%peer, error = %e, "Failed to send RPC response");
                break;
            }
        }
        debug!(%peer, "RPC connection closed");
    }

    /// Accept connections until `cancel` fires
    ///
    /// Connections in flight get to finish their current request; the caller
    /// bounds how long that may take. A failed accept is logged and retried;
    /// only an unusable listener ends the loop with an error.
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        info!(addr = %listener.local_addr()?, "RPC server listening");
        let mut connections = JoinSet::new();
        let mut outcome = Ok(());

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        connections.spawn(self.clone().serve_connection(stream, peer, cancel.clone()));
                    }
                    Err(e) => match accept_retry_delay(&e) {
                        Some(delay) => {
                            warn!(error = %e, ?delay, "Failed to accept RPC connection");
                            tokio::select! {
                                _ = cancel.cancelled() => break,
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => {
                            error!(error = %e, "RPC listener failed");
                            outcome = Err(e.into());
                            break;
                        }
                    },
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}
        info!("RPC server stopped");
        outcome
    }
}

/// Pause after running out of descriptors or other resources
const ACCEPT_ERROR_DELAY: Duration = Duration::from_secs(1);

/// How long to wait before accepting again; `None` when the listener is unusable
fn accept_retry_delay(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::InvalidInput => None,
        // the peer went away before we picked the connection up
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted => Some(Duration::ZERO),
        _ => Some(ACCEPT_ERROR_DELAY),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::{MetricKind, MetricValue};
    use crate::rpc::{RpcCode, RpcKind, RpcMetric};
    use crate::storage::{MemStorage, MetricStorage};
    use std::sync::Arc;

    fn counter(name: &str, delta: i64) -> RpcMetric {
        RpcMetric {
            name: name.to_string(),
            kind: RpcKind::Counter,
            delta,
            value: 0.0,
        }
    }

    fn peer(ip: [u8; 4]) -> SocketAddr {
        SocketAddr::from((ip, 50000))
    }

    #[tokio::test]
    async fn test_update_metrics_in_chunks() {
        let storage = Arc::new(MemStorage::new());
        let server = RpcServer::new(IngestService::new(storage.clone()), TrustedSubnet::any());

        let batch = (0..150).map(|i| counter(&format!("metric{i}"), i)).collect();
        let response = server
            .handle(peer([127, 0, 0, 1]), RpcRequest::UpdateMetrics(batch))
            .await;

        assert_eq!(response, RpcResponse::Ok);
        assert_eq!(storage.len(), 150);
        let metric = storage.get(MetricKind::Counter, "metric42").await.unwrap();
        assert_eq!(metric.value, MetricValue::Counter(42));
    }

    #[tokio::test]
    async fn test_untrusted_peer_is_denied() {
        let storage = Arc::new(MemStorage::new());
        let server = RpcServer::new(
            IngestService::new(storage.clone()),
            TrustedSubnet::parse("10.0.0.0/8").unwrap(),
        );

        let response = server
            .handle(
                peer([192, 168, 0, 5]),
                RpcRequest::UpdateMetrics(vec![counter("c", 1)]),
            )
            .await;

        assert!(matches!(
            response,
            RpcResponse::Error {
                code: RpcCode::PermissionDenied,
                ..
            }
        ));
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_record_rejects_whole_batch() {
        let storage = Arc::new(MemStorage::new());
        let server = RpcServer::new(IngestService::new(storage.clone()), TrustedSubnet::any());

        let batch = vec![counter("ok", 1), counter("", 1)];
        let response = server
            .handle(peer([127, 0, 0, 1]), RpcRequest::UpdateMetrics(batch))
            .await;

        assert!(matches!(
            response,
            RpcResponse::Error {
                code: RpcCode::InvalidArgument,
                ..
            }
        ));
        assert!(storage.is_empty());
    }

    #[test]
    fn test_accept_errors_are_retried() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_retry_delay(&aborted), Some(Duration::ZERO));

        // e.g. EMFILE: back off so descriptors can free up
        let exhausted = io::Error::other("too many open files");
        assert_eq!(accept_retry_delay(&exhausted), Some(ACCEPT_ERROR_DELAY));

        let broken = io::Error::from(io::ErrorKind::InvalidInput);
        assert_eq!(accept_retry_delay(&broken), None);
    }

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let storage = Arc::new(MemStorage::new());
        let server = RpcServer::new(IngestService::new(storage.clone()), TrustedSubnet::any());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(server.serve(listener, cancel.clone()));

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut client = rpc::framed(stream);
        for _ in 0..2 {
            rpc::send(&mut client, &RpcRequest::UpdateMetrics(vec![counter("PollCount", 3)]))
                .await
                .unwrap();
            let response: RpcResponse = rpc::recv(&mut client).await.unwrap().unwrap();
            assert_eq!(response, RpcResponse::Ok);
        }

        cancel.cancel();
        handle.await.unwrap().unwrap();

        let metric = storage.get(MetricKind::Counter, "PollCount").await.unwrap();
        assert_eq!(metric.value, MetricValue::Counter(6));
    }
}
