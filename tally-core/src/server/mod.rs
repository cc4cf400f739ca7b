/*!
The collector server: storage assembly, both front doors and the ordered
shutdown that ends with a final snapshot flush.
*/

pub mod http;
pub mod rpc;

pub use http::{create_router, AppState};
pub use rpc::RpcServer;

use crate::config::ServerConfig;
use crate::ingest::IngestService;
use crate::signing::BodySigner;
use crate::storage::{MemStorage, MetricStorage, SnapshotStorage};
use crate::{Result, TallyError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[cfg(feature = "postgres")]
use crate::storage::PgStorage;

type Backend = SnapshotStorage<Arc<dyn MetricStorage>>;

/// Why the server began shutting down
#[derive(Debug)]
pub enum ShutdownReason {
    /// The caller's cancellation token fired
    Cancelled,
    /// A listener stopped on its own
    ListenerFailed {
        listener: &'static str,
        error: TallyError,
    },
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "shutdown requested"),
            Self::ListenerFailed { listener, error } => {
                write!(f, "{listener} listener failed: {error}")
            }
        }
    }
}

/// A server with its storage opened and its listeners bound
pub struct Server {
    config: ServerConfig,
    storage: Arc<Backend>,
    #[cfg(feature = "postgres")]
    database: Option<PgStorage>,
    http: TcpListener,
    rpc: Option<TcpListener>,
    ingest: IngestService,
}

impl Server {
    /// Open storage and bind every configured listener
    ///
    /// # Errors
    /// Invalid configuration, an unusable DSN, a failed schema bootstrap or
    /// a listener that cannot bind.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;

        #[cfg(feature = "postgres")]
        let (inner, database) = open_backend(&config).await?;
        #[cfg(not(feature = "postgres"))]
        let inner = open_backend(&config)?;

        let storage = Arc::new(SnapshotStorage::open(inner, config.snapshot_options()).await?);
        let ingest = IngestService::new(storage.clone());

        let http = TcpListener::bind(&config.address).await.map_err(|e| {
            TallyError::config(format!("cannot bind HTTP listener on {}: {e}", config.address))
        })?;
        let rpc = match &config.rpc_address {
            Some(address) if !address.trim().is_empty() => {
                Some(TcpListener::bind(address).await.map_err(|e| {
                    TallyError::config(format!("cannot bind RPC listener on {address}: {e}"))
                })?)
            }
            _ => None,
        };

        Ok(Self {
            config,
            storage,
            #[cfg(feature = "postgres")]
            database,
            http,
            rpc,
            ingest,
        })
    }

    pub fn http_addr(&self) -> Result<SocketAddr> {
        Ok(self.http.local_addr()?)
    }

    pub fn rpc_addr(&self) -> Result<Option<SocketAddr>> {
        self.rpc
            .as_ref()
            .map(|listener| listener.local_addr())
            .transpose()
            .map_err(TallyError::from)
    }

    pub fn ingest(&self) -> &IngestService {
        &self.ingest
    }

    /// Serve until `cancel` fires or a listener fails
    ///
    /// Shutdown stops both listeners, gives in-flight requests the configured
    /// grace period, writes the final snapshot and closes the database pool.
    ///
    /// # Errors
    /// The listener error when one caused the shutdown.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let subnet = self.config.subnet()?;
        let stop = cancel.child_token();
        let mut listeners: JoinSet<(&'static str, Result<()>)> = JoinSet::new();

        let state = AppState {
            ingest: self.ingest.clone(),
            subnet,
            signer: BodySigner::from_key(self.config.key.as_deref()),
        };
        let router = create_router(state);
        info!(addr = %self.http.local_addr()?, %subnet, "HTTP server listening");
        let http_stop = stop.clone();
        let http = self.http;
        listeners.spawn(async move {
            let served = axum::serve(
                http,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(http_stop.cancelled_owned())
            .await
            .map_err(TallyError::from);
            ("http", served)
        });

        if let Some(listener) = self.rpc {
            let server = RpcServer::new(self.ingest.clone(), subnet);
            let rpc_stop = stop.clone();
            listeners.spawn(async move { ("rpc", server.serve(listener, rpc_stop).await) });
        }

        let reason = tokio::select! {
            _ = stop.cancelled() => ShutdownReason::Cancelled,
            Some(joined) = listeners.join_next() => listener_outcome(joined),
        };
        match &reason {
            ShutdownReason::Cancelled => info!(%reason, "Server shutting down"),
            ShutdownReason::ListenerFailed { .. } => error!(%reason, "Server shutting down"),
        }
        stop.cancel();

        let grace = self.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while let Some(joined) = listeners.join_next().await {
                if let ShutdownReason::ListenerFailed { listener, error } = listener_outcome(joined)
                {
                    warn!(listener, error = %error, "Listener failed while draining");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                grace_ms = grace.as_millis() as u64,
                "In-flight requests did not finish in time, aborting"
            );
            listeners.shutdown().await;
        }

        self.storage.shutdown().await;
        #[cfg(feature = "postgres")]
        if let Some(database) = &self.database {
            database.close().await;
        }
        info!("Server stopped");

        match reason {
            ShutdownReason::Cancelled => Ok(()),
            ShutdownReason::ListenerFailed { error, .. } => Err(error),
        }
    }
}

/// A listener task that returns `Ok` before shutdown still counts as a failure
fn listener_outcome(
    joined: std::result::Result<(&'static str, Result<()>), tokio::task::JoinError>,
) -> ShutdownReason {
    match joined {
        Ok((listener, Err(error))) => ShutdownReason::ListenerFailed { listener, error },
        Ok((listener, Ok(()))) => ShutdownReason::ListenerFailed {
            listener,
            error: TallyError::Io(std::io::Error::other("listener stopped unexpectedly")),
        },
        Err(e) => ShutdownReason::ListenerFailed {
            listener: "unknown",
            error: TallyError::Io(std::io::Error::other(format!("listener task failed: {e}"))),
        },
    }
}

#[cfg(feature = "postgres")]
async fn open_backend(
    config: &ServerConfig,
) -> Result<(Arc<dyn MetricStorage>, Option<PgStorage>)> {
    match config.database_dsn.as_deref().map(str::trim) {
        Some(dsn) if !dsn.is_empty() => {
            let database = PgStorage::connect(dsn, config.backoff_policy())?;
            database.bootstrap().await?;
            Ok((Arc::new(database.clone()), Some(database)))
        }
        _ => {
            info!("Using in-memory storage");
            Ok((Arc::new(MemStorage::new()), None))
        }
    }
}

#[cfg(not(feature = "postgres"))]
fn open_backend(config: &ServerConfig) -> Result<Arc<dyn MetricStorage>> {
    if config.database_dsn.as_deref().is_some_and(|dsn| !dsn.trim().is_empty()) {
        return Err(TallyError::config(
            "a database DSN was given but Postgres support is not compiled in",
        ));
    }
    info!("Using in-memory storage");
    Ok(Arc::new(MemStorage::new()))
}

/// Bind and run the server until `cancel` fires
pub async fn run_server(config: ServerConfig, cancel: CancellationToken) -> Result<()> {
    Server::bind(config).await?.run(cancel).await
}
