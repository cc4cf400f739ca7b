/*!
HTTP front door.

Routes:
- `GET /` - every stored metric as a JSON array of records
- `POST /update/` - one JSON record; answers with the stored state
- `POST /update/{kind}/{name}/{value}` - one path-encoded metric
- `POST /updates/` - JSON array of records, stored in chunks
- `POST /value/` - JSON probe `{id, type}`; answers with the stored record
- `GET|POST /value/{kind}/{name}` - plain-text value
- `GET /ping` - storage liveness
- `GET /metrics` - Prometheus counters (`metrics` feature)

Requests pass the trusted-subnet filter, then the body signature check,
then gzip decompression. Responses are gzip-compressed on request.
*/

use crate::ingest::IngestService;
use crate::metric::{MetricKind, MetricRecord};
use crate::observability::record_ingest;
use crate::signing::{BodySigner, SIGNATURE_HEADER};
use crate::subnet::TrustedSubnet;
use crate::TallyError;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::de::DeserializeOwned;
use std::net::SocketAddr;
use tower_http::compression::CompressionLayer;
use tower_http::decompression::RequestDecompressionLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

/// Largest request body the signature check will buffer
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Header a proxy (or the agent itself) uses to name the original caller
const REAL_IP_HEADER: &str = "x-real-ip";

/// Shared state of the HTTP front door
#[derive(Clone)]
pub struct AppState {
    pub ingest: IngestService,
    pub subnet: TrustedSubnet,
    pub signer: Option<BodySigner>,
}

/// Error wrapper mapping [`TallyError`] onto HTTP status codes
#[derive(Debug)]
pub struct ApiError(TallyError);

impl From<TallyError> for ApiError {
    fn from(err: TallyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            TallyError::Validation(_) | TallyError::Json(_) => StatusCode::BAD_REQUEST,
            TallyError::NotFound { .. } => StatusCode::NOT_FOUND,
            TallyError::PermissionDenied(_) => StatusCode::FORBIDDEN,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, %status, "Request rejected");
        }
        (status, self.0.to_string()).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> ApiResult<T> {
    Ok(serde_json::from_slice(body).map_err(TallyError::from)?)
}

/// Create the router with every route and middleware
pub fn create_router(state: AppState) -> Router {
    let router = Router::new()
        .route("/", get(list_handler))
        .route("/update/", post(update_json_handler))
        .route("/update/{kind}/{name}/{value}", post(update_path_handler))
        .route("/updates/", post(update_batch_handler))
        .route("/value/", post(value_json_handler))
        .route(
            "/value/{kind}/{name}",
            get(value_path_handler).post(value_path_handler),
        )
        .route("/ping", get(ping_handler));

    #[cfg(feature = "metrics")]
    let router = router.route("/metrics", get(prometheus_handler));

    router
        .with_state(state.clone())
        .layer(RequestDecompressionLayer::new())
        .layer(middleware::from_fn_with_state(state.clone(), verify_signature))
        .layer(middleware::from_fn_with_state(state, trusted_subnet))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
}

/// Resolve the caller's address: `X-Real-IP` unless blank or "unknown",
/// otherwise the socket peer
fn client_ip(req: &Request) -> Option<String> {
    let header = req
        .headers()
        .get(REAL_IP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("unknown"));
    if let Some(ip) = header {
        return Some(ip.to_string());
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

async fn trusted_subnet(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if state.subnet.is_configured() {
        let allowed = client_ip(&req).is_some_and(|ip| state.subnet.allows(&ip));
        if !allowed {
            warn!(
                path = %req.uri().path(),
                client = client_ip(&req).as_deref().unwrap_or("unresolved"),
                subnet = %state.subnet,
                "Rejected request from untrusted address"
            );
            return StatusCode::FORBIDDEN.into_response();
        }
    }
    next.run(req).await
}

async fn verify_signature(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let Some(signer) = &state.signer else {
        return next.run(req).await;
    };
    let Some(signature) = req
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    else {
        return next.run(req).await;
    };

    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!(error = %e, "Failed to read request body");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };
    if !signer.verify(&bytes, &signature) {
        warn!(path = %parts.uri.path(), "Body signature mismatch");
        return (StatusCode::BAD_REQUEST, "body signature mismatch").into_response();
    }

    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

async fn list_handler(State(state): State<AppState>) -> ApiResult<Json<Vec<MetricRecord>>> {
    let metrics = state.ingest.list().await?;
    Ok(Json(metrics.iter().map(MetricRecord::from).collect()))
}

async fn update_json_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<MetricRecord>> {
    let result = async {
        let record: MetricRecord = parse_json(&body)?;
        Ok::<_, ApiError>(state.ingest.update_record(record).await?)
    }
    .await;
    record_ingest("http", 1, result.is_ok());
    Ok(Json(MetricRecord::from(result?)))
}

async fn update_path_handler(
    State(state): State<AppState>,
    Path((kind, name, value)): Path<(String, String, String)>,
) -> ApiResult<StatusCode> {
    let result = async {
        let metric = IngestService::parse(&kind, &name, &value)?;
        state.ingest.update(metric).await
    }
    .await;
    record_ingest("http", 1, result.is_ok());
    result?;
    Ok(StatusCode::OK)
}

async fn update_batch_handler(State(state): State<AppState>, body: Bytes) -> ApiResult<StatusCode> {
    let records: Vec<MetricRecord> = match parse_json(&body) {
        Ok(records) => records,
        Err(e) => {
            record_ingest("http", 0, false);
            return Err(e);
        }
    };
    let count = records.len();
    let result = state.ingest.update_records(records).await;
    record_ingest("http", count, result.is_ok());
    result?;
    Ok(StatusCode::OK)
}

async fn value_json_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<MetricRecord>> {
    let probe: MetricRecord = parse_json(&body)?;
    let (kind, id) = probe.key()?;
    let metric = state.ingest.value(kind, id).await?;
    Ok(Json(MetricRecord::from(metric)))
}

async fn value_path_handler(
    State(state): State<AppState>,
    Path((kind, name)): Path<(String, String)>,
) -> ApiResult<String> {
    let kind: MetricKind = kind.parse()?;
    let metric = state.ingest.value(kind, &name).await?;
    Ok(metric.value.to_string())
}

async fn ping_handler(State(state): State<AppState>) -> StatusCode {
    if state.ingest.ping().await {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

#[cfg(feature = "metrics")]
async fn prometheus_handler() -> ApiResult<String> {
    let metrics = crate::observability::TallyMetrics::global()
        .ok_or_else(|| TallyError::storage("metrics are unavailable"))?;
    Ok(metrics.gather_metrics()?)
}
