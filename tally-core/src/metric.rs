/*!
Metric data model: gauges, counters and their wire representation.
*/

use crate::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two metric families. Identifiers are namespaced by kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Latest absolute reading wins
    Gauge,
    /// Stored value is the running sum of all deltas
    Counter,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Gauge => "gauge",
            MetricKind::Counter => "counter",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        if s.eq_ignore_ascii_case("gauge") {
            Ok(MetricKind::Gauge)
        } else if s.eq_ignore_ascii_case("counter") {
            Ok(MetricKind::Counter)
        } else {
            Err(TallyError::validation(format!("unknown metric type '{s}'")))
        }
    }
}

/// A typed metric reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricValue {
    Gauge(f64),
    Counter(i64),
}

impl MetricValue {
    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Gauge(_) => MetricKind::Gauge,
            MetricValue::Counter(_) => MetricKind::Counter,
        }
    }

    /// Parse a raw textual value for the given kind.
    ///
    /// Counter deltas must be integers in `i64` range; gauges must be finite floats.
    pub fn parse(kind: MetricKind, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        match kind {
            MetricKind::Counter => raw.parse::<i64>().map(MetricValue::Counter).map_err(|e| {
                TallyError::validation(format!("invalid counter value '{raw}': {e}"))
            }),
            MetricKind::Gauge => {
                let value = raw.parse::<f64>().map_err(|e| {
                    TallyError::validation(format!("invalid gauge value '{raw}': {e}"))
                })?;
                MetricValue::gauge_checked(value)
            }
        }
    }

    fn gauge_checked(value: f64) -> Result<Self> {
        if value.is_finite() {
            Ok(MetricValue::Gauge(value))
        } else {
            Err(TallyError::validation(format!(
                "gauge value must be finite, got {value}"
            )))
        }
    }
}

impl fmt::Display for MetricValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetricValue::Gauge(v) => write!(f, "{v}"),
            MetricValue::Counter(d) => write!(f, "{d}"),
        }
    }
}

/// A single named metric reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub id: String,
    pub value: MetricValue,
}

impl Metric {
    pub fn gauge(id: impl Into<String>, value: f64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Gauge(value),
        }
    }

    pub fn counter(id: impl Into<String>, delta: i64) -> Self {
        Self {
            id: id.into(),
            value: MetricValue::Counter(delta),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.value.kind()
    }

    /// Build a metric from its path-encoded parts (`{kind}/{name}/{value}`).
    pub fn parse(kind: &str, id: &str, raw: &str) -> Result<Self> {
        let kind = kind.parse::<MetricKind>()?;
        let id = validate_id(id)?;
        let value = MetricValue::parse(kind, raw)?;
        Ok(Self {
            id: id.to_string(),
            value,
        })
    }
}

pub(crate) fn validate_id(id: &str) -> Result<&str> {
    if id.trim().is_empty() {
        return Err(TallyError::validation("metric name must not be empty"));
    }
    Ok(id)
}

/// JSON wire form of a metric.
///
/// `type` is kept as a string so an unknown kind surfaces as a validation
/// error rather than a decoding error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub mtype: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
}

impl MetricRecord {
    /// Lookup key of a record used as a `/value/` probe.
    pub fn key(&self) -> Result<(MetricKind, &str)> {
        let kind = self.mtype.parse::<MetricKind>()?;
        Ok((kind, validate_id(&self.id)?))
    }
}

impl From<&Metric> for MetricRecord {
    fn from(metric: &Metric) -> Self {
        let (delta, value) = match metric.value {
            MetricValue::Gauge(v) => (None, Some(v)),
            MetricValue::Counter(d) => (Some(d), None),
        };
        Self {
            id: metric.id.clone(),
            mtype: metric.kind().as_str().to_string(),
            delta,
            value,
        }
    }
}

impl From<Metric> for MetricRecord {
    fn from(metric: Metric) -> Self {
        MetricRecord::from(&metric)
    }
}

impl TryFrom<MetricRecord> for Metric {
    type Error = TallyError;

    fn try_from(record: MetricRecord) -> Result<Self> {
        let (kind, _) = record.key()?;
        let value = match kind {
            MetricKind::Gauge => {
                let value = record.value.ok_or_else(|| {
                    TallyError::validation(format!("gauge '{}' has no value", record.id))
                })?;
                MetricValue::gauge_checked(value)?
            }
            MetricKind::Counter => MetricValue::Counter(record.delta.ok_or_else(|| {
                TallyError::validation(format!("counter '{}' has no delta", record.id))
            })?),
        };
        Ok(Metric {
            id: record.id,
            value,
        })
    }
}
