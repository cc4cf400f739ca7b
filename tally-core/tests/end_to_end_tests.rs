/*!
End-to-end tests: an agent delivering to a real server over loopback.
*/

use std::sync::Arc;
use std::time::Duration;
use tally_core::agent::{DeliveryPool, HttpTransport, MetricsTransport, RpcTransport};
use tally_core::server::Server;
use tally_core::{
    AgentConfig, BodySigner, MemStorage, Metric, MetricKind, MetricRecord, MetricValue,
    ServerConfig, SnapshotFile, TallyError, TransportKind,
};
use tally_retry::{BackoffPolicy, RetryableError};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Running {
    http: String,
    rpc: String,
    cancel: CancellationToken,
    handle: JoinHandle<tally_core::Result<()>>,
}

impl Running {
    async fn stop(self) {
        self.cancel.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

fn server_config(dir: &TempDir) -> ServerConfig {
    ServerConfig {
        address: "127.0.0.1:0".to_string(),
        rpc_address: Some("127.0.0.1:0".to_string()),
        file_storage_path: Some(dir.path().join("metrics.json")),
        store_interval: Duration::from_secs(300),
        shutdown_grace: Duration::from_secs(2),
        ..ServerConfig::default()
    }
}

async fn start(config: ServerConfig) -> Running {
    let server = Server::bind(config).await.unwrap();
    let http = server.http_addr().unwrap().to_string();
    let rpc = server.rpc_addr().unwrap().unwrap().to_string();
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(server.run(cancel.clone()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    Running {
        http,
        rpc,
        cancel,
        handle,
    }
}

fn buffer_with(metrics: &[Metric]) -> Arc<MemStorage> {
    let buffer = Arc::new(MemStorage::new());
    for metric in metrics {
        buffer.apply(metric).unwrap();
    }
    buffer
}

fn pool(buffer: Arc<MemStorage>, transport: Arc<dyn MetricsTransport>) -> DeliveryPool {
    DeliveryPool::new(
        buffer,
        transport,
        BackoffPolicy::new(vec![Duration::from_millis(10); 2]),
        Duration::from_secs(1),
        1,
    )
}

async fn get_text(url: String) -> (reqwest::StatusCode, String) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status();
    (status, response.text().await.unwrap())
}

#[tokio::test]
async fn test_http_delivery_with_gzip_and_signature() {
    let dir = TempDir::new().unwrap();
    let server = start(ServerConfig {
        key: Some("shared-secret".to_string()),
        ..server_config(&dir)
    })
    .await;

    let transport = HttpTransport::new(
        &server.http,
        true,
        Some(BodySigner::new("shared-secret")),
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    let buffer = buffer_with(&[Metric::counter("PollCount", 5), Metric::gauge("Alloc", 12.5)]);
    let pool = pool(buffer, Arc::new(transport));

    assert_eq!(pool.deliver_once().await.unwrap(), 2);
    assert_eq!(pool.deliver_once().await.unwrap(), 2);

    let (status, body) = get_text(format!("http://{}/value/counter/PollCount", server.http)).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert_eq!(body, "10");

    let (_, body) = get_text(format!("http://{}/value/gauge/Alloc", server.http)).await;
    assert_eq!(body, "12.5");

    server.stop().await;
}

#[tokio::test]
async fn test_wrong_signing_key_is_rejected_without_retry() {
    let dir = TempDir::new().unwrap();
    let server = start(ServerConfig {
        key: Some("server-key".to_string()),
        ..server_config(&dir)
    })
    .await;

    let transport = HttpTransport::new(
        &server.http,
        false,
        Some(BodySigner::new("agent-key")),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    let err = transport
        .send_metrics(&[Metric::counter("PollCount", 1)])
        .await
        .unwrap_err();
    assert!(matches!(err, TallyError::Transport { .. }));
    assert!(!err.is_transient());

    let (status, _) = get_text(format!("http://{}/value/counter/PollCount", server.http)).await;
    assert_eq!(status, reqwest::StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn test_rpc_delivery() {
    let dir = TempDir::new().unwrap();
    let server = start(server_config(&dir)).await;

    let transport = RpcTransport::new(&server.rpc, Duration::from_secs(2));
    let buffer = buffer_with(&[Metric::counter("PollCount", 3), Metric::gauge("RandomValue", 0.25)]);
    let pool = pool(buffer, Arc::new(transport));

    for _ in 0..3 {
        assert_eq!(pool.deliver_once().await.unwrap(), 2);
    }

    let (_, body) = get_text(format!("http://{}/value/counter/PollCount", server.http)).await;
    assert_eq!(body, "9");
    let (_, body) = get_text(format!("http://{}/value/gauge/RandomValue", server.http)).await;
    assert_eq!(body, "0.25");

    server.stop().await;
}

#[tokio::test]
async fn test_untrusted_agent_is_refused_on_both_transports() {
    let dir = TempDir::new().unwrap();
    let server = start(ServerConfig {
        trusted_subnet: Some("10.0.0.0/8".to_string()),
        ..server_config(&dir)
    })
    .await;

    let http = HttpTransport::new(&server.http, false, None, Duration::from_secs(2))
        .await
        .unwrap();
    let err = http.send_metrics(&[Metric::counter("c", 1)]).await.unwrap_err();
    assert!(!err.is_transient(), "{err}");

    let rpc = RpcTransport::new(&server.rpc, Duration::from_secs(2));
    let err = rpc.send_metrics(&[Metric::counter("c", 1)]).await.unwrap_err();
    assert!(!err.is_transient(), "{err}");

    server.stop().await;
}

#[tokio::test]
async fn test_large_batch_over_http_is_fully_stored() {
    let dir = TempDir::new().unwrap();
    let server = start(server_config(&dir)).await;

    let records: Vec<MetricRecord> = (0..250)
        .map(|i| MetricRecord::from(&Metric::gauge(format!("g{i}"), i as f64)))
        .collect();
    let response = reqwest::Client::new()
        .post(format!("http://{}/updates/", server.http))
        .json(&records)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());

    let listed: Vec<MetricRecord> = reqwest::get(format!("http://{}/", server.http))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(listed.len(), 250);

    server.stop().await;
}

#[tokio::test]
async fn test_snapshot_survives_restart() {
    let dir = TempDir::new().unwrap();
    let server = start(server_config(&dir)).await;

    let transport = RpcTransport::new(&server.rpc, Duration::from_secs(2));
    transport
        .send_metrics(&[Metric::counter("PollCount", 4), Metric::gauge("Alloc", 2.0)])
        .await
        .unwrap();
    server.stop().await;

    let saved = SnapshotFile::new(dir.path().join("metrics.json"))
        .load()
        .unwrap()
        .unwrap();
    assert_eq!(saved.len(), 2);

    let restarted = Server::bind(server_config(&dir)).await.unwrap();
    let metric = restarted
        .ingest()
        .value(MetricKind::Counter, "PollCount")
        .await
        .unwrap();
    assert_eq!(metric.value, MetricValue::Counter(4));
}

#[tokio::test]
async fn test_running_agent_reports_to_server() {
    let dir = TempDir::new().unwrap();
    let server = start(server_config(&dir)).await;

    for transport in [TransportKind::Http, TransportKind::Rpc] {
        let address = match transport {
            TransportKind::Http => server.http.clone(),
            TransportKind::Rpc => server.rpc.clone(),
        };
        let config = AgentConfig {
            address,
            transport,
            poll_interval: Duration::from_millis(20),
            report_interval: Duration::from_millis(50),
            rate_limit: 2,
            shutdown_grace: Duration::from_secs(1),
            ..AgentConfig::default()
        };

        let cancel = CancellationToken::new();
        let agent = tokio::spawn(tally_core::agent::run_agent(config, cancel.clone()));
        tokio::time::sleep(Duration::from_millis(500)).await;
        cancel.cancel();
        agent.await.unwrap().unwrap();
    }

    let (status, body) = get_text(format!("http://{}/value/counter/PollCount", server.http)).await;
    assert_eq!(status, reqwest::StatusCode::OK);
    assert!(body.parse::<i64>().unwrap() > 0);

    let (status, _) = get_text(format!("http://{}/value/gauge/RandomValue", server.http)).await;
    assert_eq!(status, reqwest::StatusCode::OK);

    server.stop().await;
}
