/*!
Delivery transports.

A transport sends one batch to the collector server and reports failures
as [`TallyError::Transport`], flagged transient when a later attempt could
succeed (refused connection, timeout, server-side error) and fatal when
the server rejected the batch itself.
*/

use crate::compression::{CompressionAdapter, GzipCompressor, NoCompression};
use crate::metric::{Metric, MetricRecord};
use crate::rpc::{self, RpcCode, RpcFramed, RpcMetric, RpcRequest, RpcResponse};
use crate::signing::{BodySigner, SIGNATURE_HEADER};
use crate::{Result, TallyError};
use async_trait::async_trait;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Duration;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tracing::{debug, warn};

/// Header the server trusts for the caller's address
pub const REAL_IP_HEADER: &str = "X-Real-IP";

/// Sends metric batches to the collector server
#[async_trait]
pub trait MetricsTransport: Send + Sync {
    async fn send_metrics(&self, batch: &[Metric]) -> Result<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Local address the OS would use to reach `address`
///
/// Connecting a UDP socket sends no packets; it only selects a route.
pub async fn local_ip_for(address: &str) -> Option<IpAddr> {
    let target = lookup_host(address).await.ok()?.next()?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await.ok()?;
    socket.connect(target).await.ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn classify_reqwest(err: reqwest::Error) -> TallyError {
    let message = format!("HTTP request failed: {err}");
    if err.is_connect() || err.is_timeout() || err.is_request() {
        TallyError::transient_transport(message)
    } else {
        TallyError::fatal_transport(message)
    }
}

/// JSON-over-HTTP transport posting batches to `/updates/`
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    compressor: Box<dyn CompressionAdapter>,
    signer: Option<BodySigner>,
    real_ip: Option<IpAddr>,
}

impl HttpTransport {
    /// Create a transport for the server at `address` (`host:port`)
    ///
    /// # Arguments
    /// * `compress` - gzip request bodies
    /// * `signer` - attach an HMAC-SHA256 signature of the wire body
    /// * `timeout` - per-request timeout
    pub async fn new(
        address: &str,
        compress: bool,
        signer: Option<BodySigner>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TallyError::config(format!("cannot build HTTP client: {e}")))?;

        let base = if address.starts_with("http://") || address.starts_with("https://") {
            address.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", address.trim_end_matches('/'))
        };
        let host = base
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&base)
            .to_string();

        let real_ip = local_ip_for(&host).await;
        if real_ip.is_none() {
            warn!(server = %host, "Local IP could not be determined, X-Real-IP disabled");
        }

        let compressor: Box<dyn CompressionAdapter> = if compress {
            Box::new(GzipCompressor::new())
        } else {
            Box::new(NoCompression)
        };

        Ok(Self {
            client,
            url: format!("{base}/updates/"),
            compressor,
            signer,
            real_ip,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Serialize, compress and sign a batch exactly as it goes on the wire
    fn encode(&self, batch: &[Metric]) -> Result<(Vec<u8>, Option<String>)> {
        let records: Vec<MetricRecord> = batch.iter().map(MetricRecord::from).collect();
        let body = self.compressor.compress(&serde_json::to_vec(&records)?)?;
        let signature = self.signer.as_ref().map(|s| s.sign(&body));
        Ok((body, signature))
    }
}

#[async_trait]
impl MetricsTransport for HttpTransport {
    async fn send_metrics(&self, batch: &[Metric]) -> Result<()> {
        let (body, signature) = self.encode(batch)?;

        let mut request = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .body(body);
        if let Some(encoding) = self.compressor.content_encoding() {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        if let Some(signature) = signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        if let Some(ip) = self.real_ip {
            request = request.header(REAL_IP_HEADER, ip.to_string());
        }

        let response = request.send().await.map_err(classify_reqwest)?;
        let status = response.status();
        if status.is_success() {
            debug!(metrics = batch.len(), "Batch delivered over HTTP");
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        let message = format!("server answered {status}: {}", detail.trim());
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(TallyError::transient_transport(message))
        } else {
            Err(TallyError::fatal_transport(message))
        }
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Binary RPC transport over a small pool of persistent TCP connections
///
/// Connections are dialed on demand and dropped after any failure, so the
/// next attempt reconnects. The timeout covers dialing and the exchange.
pub struct RpcTransport {
    address: String,
    timeout: Duration,
    idle: Mutex<Vec<RpcFramed<TcpStream>>>,
}

/// Connections kept open between calls
const MAX_IDLE_CONNECTIONS: usize = 8;

impl RpcTransport {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Reuse an idle connection or dial a new one
    ///
    /// Each call owns its connection for the whole exchange, so concurrent
    /// workers never wait on each other.
    async fn checkout(&self) -> Result<RpcFramed<TcpStream>> {
        let reused = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        if let Some(framed) = reused {
            return Ok(framed);
        }
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        debug!(server = %self.address, "RPC connection established");
        Ok(rpc::framed(stream))
    }

    fn checkin(&self, framed: RpcFramed<TcpStream>) {
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_CONNECTIONS {
                idle.push(framed);
            }
        }
    }

    #[cfg(test)]
    fn idle_connections(&self) -> usize {
        self.idle.lock().map(|idle| idle.len()).unwrap_or(0)
    }

    async fn exchange(&self, request: &RpcRequest) -> Result<RpcResponse> {
        let mut framed = self.checkout().await?;
        rpc::send(&mut framed, request).await?;
        match rpc::recv(&mut framed).await? {
            Some(response) => {
                self.checkin(framed);
                Ok(response)
            }
            None => Err(TallyError::transient_transport(
                "server closed the RPC connection",
            )),
        }
    }
}

#[async_trait]
impl MetricsTransport for RpcTransport {
    async fn send_metrics(&self, batch: &[Metric]) -> Result<()> {
        let request = RpcRequest::UpdateMetrics(batch.iter().map(RpcMetric::from).collect());

        // A failed or timed-out exchange drops its connection instead of
        // returning it to the pool.
        let response = match tokio::time::timeout(self.timeout, self.exchange(&request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(TallyError::Io(io))) => {
                return Err(TallyError::transient_transport(format!(
                    "RPC I/O failed: {io}"
                )));
            }
            Ok(Err(other)) => return Err(other),
            Err(_) => {
                return Err(TallyError::transient_transport(format!(
                    "RPC call timed out after {:?}",
                    self.timeout
                )));
            }
        };

        match response {
            RpcResponse::Ok => {
                debug!(metrics = batch.len(), "Batch delivered over RPC");
                Ok(())
            }
            RpcResponse::Error {
                code: RpcCode::Internal,
                message,
            } => Err(TallyError::transient_transport(format!(
                "server error: {message}"
            ))),
            RpcResponse::Error { code, message } => Err(TallyError::fatal_transport(format!(
                "server rejected batch ({code:?}): {message}"
            ))),
        }
    }

    fn name(&self) -> &'static str {
        "rpc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;
    use tally_retry::RetryableError;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_http_body_is_compressed_and_signed() {
        let transport = HttpTransport::new(
            "127.0.0.1:8080",
            true,
            Some(BodySigner::new("secret")),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(transport.url(), "http://127.0.0.1:8080/updates/");

        let batch = vec![Metric::counter("PollCount", 1)];
        let (body, signature) = transport.encode(&batch).unwrap();

        assert!(BodySigner::new("secret").verify(&body, &signature.unwrap()));
        let plain = GzipCompressor::new().decompress(&body).unwrap();
        let records: Vec<MetricRecord> = serde_json::from_slice(&plain).unwrap();
        assert_eq!(records, vec![MetricRecord::from(&batch[0])]);
    }

    #[tokio::test]
    async fn test_http_unreachable_is_transient() {
        let transport = HttpTransport::new("127.0.0.1:1", false, None, Duration::from_secs(1))
            .await
            .unwrap();

        let err = transport
            .send_metrics(&[Metric::counter("c", 1)])
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn test_rpc_unreachable_is_transient() {
        let transport = RpcTransport::new("127.0.0.1:1", Duration::from_secs(1));

        let err = transport
            .send_metrics(&[Metric::gauge("g", 1.0)])
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    /// RPC server answering every request after `delay`; returns its address
    /// and the number of connections it accepted
    async fn slow_rpc_server(delay: Duration) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = accepted.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut framed = rpc::framed(stream);
                    while let Ok(Some(_)) = rpc::recv::<_, RpcRequest>(&mut framed).await {
                        tokio::time::sleep(delay).await;
                        if rpc::send(&mut framed, &RpcResponse::Ok).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (address, accepted)
    }

    #[tokio::test]
    async fn test_rpc_concurrent_sends_do_not_queue() {
        let (address, accepted) = slow_rpc_server(Duration::from_millis(300)).await;
        let transport = RpcTransport::new(address, Duration::from_secs(2));
        let batch = [Metric::counter("PollCount", 1)];

        let started = Instant::now();
        let (a, b, c) = tokio::join!(
            transport.send_metrics(&batch),
            transport.send_metrics(&batch),
            transport.send_metrics(&batch),
        );
        let elapsed = started.elapsed();
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert!(elapsed < Duration::from_millis(700), "took {elapsed:?}");
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
        assert_eq!(transport.idle_connections(), 3);

        // Later calls reuse the pooled connections
        transport.send_metrics(&batch).await.unwrap();
        assert_eq!(accepted.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rpc_timeout_covers_slow_server() {
        let (address, _) = slow_rpc_server(Duration::from_millis(500)).await;
        let transport = RpcTransport::new(address, Duration::from_millis(100));

        let err = transport
            .send_metrics(&[Metric::gauge("g", 1.0)])
            .await
            .unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert_eq!(transport.idle_connections(), 0);
    }

    #[tokio::test]
    async fn test_local_ip_for_loopback() {
        assert_eq!(
            local_ip_for("127.0.0.1:8080").await,
            Some("127.0.0.1".parse().unwrap())
        );
        assert_eq!(local_ip_for("no port here").await, None);
    }
}
