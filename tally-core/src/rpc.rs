/*!
Binary RPC wire format.

Every message travels as one length-delimited frame (4-byte big-endian
length prefix) carrying a `bincode` payload. A connection carries any
number of request/response pairs, strictly alternating.
*/

use crate::metric::{Metric, MetricKind, MetricValue};
use crate::{Result, TallyError};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Largest frame either side will accept
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Metric kind as spelled on the binary wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcKind {
    Gauge,
    Counter,
}

/// One metric on the binary wire; only the field matching `kind` is meaningful
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMetric {
    pub name: String,
    pub kind: RpcKind,
    pub delta: i64,
    pub value: f64,
}

impl From<&Metric> for RpcMetric {
    fn from(metric: &Metric) -> Self {
        let (kind, delta, value) = match metric.value {
            MetricValue::Gauge(v) => (RpcKind::Gauge, 0, v),
            MetricValue::Counter(d) => (RpcKind::Counter, d, 0.0),
        };
        Self {
            name: metric.id.clone(),
            kind,
            delta,
            value,
        }
    }
}

impl TryFrom<RpcMetric> for Metric {
    type Error = TallyError;

    fn try_from(wire: RpcMetric) -> Result<Self> {
        let kind = match wire.kind {
            RpcKind::Gauge => MetricKind::Gauge,
            RpcKind::Counter => MetricKind::Counter,
        };
        // Reuse the textual validation so both front doors reject the same input.
        let raw = match kind {
            MetricKind::Gauge => wire.value.to_string(),
            MetricKind::Counter => wire.delta.to_string(),
        };
        Metric::parse(kind.as_str(), &wire.name, &raw)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcRequest {
    UpdateMetrics(Vec<RpcMetric>),
}

/// Status codes carried by [`RpcResponse::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcCode {
    InvalidArgument,
    PermissionDenied,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RpcResponse {
    Ok,
    Error { code: RpcCode, message: String },
}

impl RpcResponse {
    /// Map a server-side failure to its wire status
    pub fn from_error(err: &TallyError) -> Self {
        let code = match err {
            TallyError::Validation(_) | TallyError::Json(_) | TallyError::NotFound { .. } => {
                RpcCode::InvalidArgument
            }
            TallyError::PermissionDenied(_) => RpcCode::PermissionDenied,
            _ => RpcCode::Internal,
        };
        RpcResponse::Error {
            code,
            message: err.to_string(),
        }
    }
}

/// A framed connection speaking the Tally RPC protocol
pub type RpcFramed<T> = Framed<T, LengthDelimitedCodec>;

pub fn framed<T: AsyncRead + AsyncWrite>(io: T) -> RpcFramed<T> {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_framed(io)
}

pub fn encode<M: Serialize>(message: &M) -> Result<Bytes> {
    bincode::serialize(message)
        .map(Bytes::from)
        .map_err(|e| TallyError::validation(format!("failed to encode RPC message: {e}")))
}

pub fn decode<M: DeserializeOwned>(frame: &[u8]) -> Result<M> {
    bincode::deserialize(frame)
        .map_err(|e| TallyError::validation(format!("malformed RPC message: {e}")))
}

/// Write one message as a frame
pub async fn send<T, M>(framed: &mut RpcFramed<T>, message: &M) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: Serialize,
{
    framed.send(encode(message)?).await?;
    Ok(())
}

/// Read the next message; `Ok(None)` when the peer closed the connection
pub async fn recv<T, M>(framed: &mut RpcFramed<T>) -> Result<Option<M>>
where
    T: AsyncRead + AsyncWrite + Unpin,
    M: DeserializeOwned,
{
    match framed.next().await {
        Some(frame) => Ok(Some(decode(&frame?)?)),
        None => Ok(None),
    }
}
