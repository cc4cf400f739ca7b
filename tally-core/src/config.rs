//! Configuration for the server and the agent
//!
//! Both configurations deserialize from a JSON file in which every field is
//! optional; the command line then overrides individual fields. Durations
//! use humantime syntax (`"500ms"`, `"2s"`, `"1m30s"`); flags also accept a
//! bare number of seconds.

use crate::storage::SnapshotOptions;
use crate::subnet::TrustedSubnet;
use crate::{Result, TallyError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tally_retry::BackoffPolicy;

/// Parse a duration such as `250ms`, `2s`, `1m30s`, `1h` or `10` (seconds)
pub fn parse_duration(text: &str) -> Result<Duration> {
    let text = text.trim();
    if text.is_empty() {
        return Err(TallyError::config("duration string is empty"));
    }
    if text.bytes().all(|b| b.is_ascii_digit()) {
        let secs: u64 = text
            .parse()
            .map_err(|e| TallyError::config(format!("invalid duration '{text}': {e}")))?;
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(text)
        .map_err(|e| TallyError::config(format!("invalid duration '{text}': {e}")))
}

/// Parse a comma-separated list of durations, e.g. `1s,3s,5s`
pub fn parse_duration_list(text: &str) -> Result<Vec<Duration>> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_duration)
        .collect()
}

/// `humantime_serde` for a list of durations
mod duration_list {
    use humantime_serde::Serde;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &[Duration], s: S) -> Result<S::Ok, S::Error> {
        s.collect_seq(value.iter().map(|d| Serde::from(*d)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<Duration>, D::Error> {
        Ok(Vec::<Serde<Duration>>::deserialize(d)?
            .into_iter()
            .map(Serde::into_inner)
            .collect())
    }
}

fn default_backoff() -> Vec<Duration> {
    tally_retry::DEFAULT_DELAYS.to_vec()
}

fn default_true() -> bool {
    true
}

/// Retry settings shared by both sides
fn backoff_policy(enabled: bool, delays: &[Duration]) -> BackoffPolicy {
    if enabled {
        BackoffPolicy::new(delays.to_vec())
    } else {
        BackoffPolicy::disabled()
    }
}

/// Collector server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP listen address
    pub address: String,
    /// Binary RPC listen address; `None` disables the RPC front door
    pub rpc_address: Option<String>,
    /// Snapshot file; empty disables snapshots
    pub file_storage_path: Option<PathBuf>,
    #[serde(with = "humantime_serde")]
    pub store_interval: Duration,
    pub restore: bool,
    /// Postgres DSN; when set the durable backend replaces the in-memory one
    pub database_dsn: Option<String>,
    /// CIDR callers must come from; empty admits everyone
    pub trusted_subnet: Option<String>,
    /// Shared HMAC key for body signatures
    pub key: Option<String>,
    #[serde(default = "default_true")]
    pub backoff: bool,
    #[serde(with = "duration_list", default = "default_backoff")]
    pub backoff_intervals: Vec<Duration>,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            rpc_address: None,
            file_storage_path: Some(PathBuf::from("/tmp/metrics-db.json")),
            store_interval: Duration::from_secs(300),
            restore: true,
            database_dsn: None,
            trusted_subnet: None,
            key: None,
            backoff: true,
            backoff_intervals: default_backoff(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    /// Load a JSON config file; missing fields keep their defaults
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn snapshot_options(&self) -> SnapshotOptions {
        SnapshotOptions {
            path: self.file_storage_path.clone(),
            flush_interval: self.store_interval,
            restore: self.restore,
        }
    }

    pub fn subnet(&self) -> Result<TrustedSubnet> {
        TrustedSubnet::parse(self.trusted_subnet.as_deref().unwrap_or(""))
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        backoff_policy(self.backoff, &self.backoff_intervals)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(TallyError::config("server address must not be empty"));
        }
        let ephemeral = self.address.trim().ends_with(":0");
        if matches!(&self.rpc_address, Some(rpc) if !ephemeral && rpc.trim() == self.address.trim()) {
            return Err(TallyError::config(
                "HTTP and RPC listeners need different addresses",
            ));
        }
        self.subnet()?;
        Ok(())
    }
}

/// Which front door the agent delivers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Http,
    Rpc,
}

impl std::str::FromStr for TransportKind {
    type Err = TallyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "http" => Ok(TransportKind::Http),
            "rpc" | "grpc" => Ok(TransportKind::Rpc),
            other => Err(TallyError::config(format!("unknown transport '{other}'"))),
        }
    }
}

/// Metrics agent settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Server `host:port` (HTTP or RPC, per `transport`)
    pub address: String,
    pub transport: TransportKind,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub report_interval: Duration,
    /// Number of concurrent delivery workers
    pub rate_limit: usize,
    pub compress_request: bool,
    pub key: Option<String>,
    #[serde(default = "default_true")]
    pub backoff: bool,
    #[serde(with = "duration_list", default = "default_backoff")]
    pub backoff_intervals: Vec<Duration>,
    /// Per-request timeout for a single delivery attempt
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            transport: TransportKind::Http,
            poll_interval: Duration::from_secs(2),
            report_interval: Duration::from_secs(10),
            rate_limit: 1,
            compress_request: true,
            key: None,
            backoff: true,
            backoff_intervals: default_backoff(),
            request_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl AgentConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_json(path.as_ref())
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        backoff_policy(self.backoff, &self.backoff_intervals)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.address.trim().is_empty() {
            return Err(TallyError::config("server address must not be empty"));
        }
        if self.rate_limit == 0 {
            return Err(TallyError::config("rate limit must be at least 1"));
        }
        if self.poll_interval.is_zero() || self.report_interval.is_zero() {
            return Err(TallyError::config(
                "poll and report intervals must be positive",
            ));
        }
        Ok(())
    }
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path).map_err(|e| {
        TallyError::config(format!("cannot read config {}: {e}", path.display()))
    })?;
    serde_json::from_slice(&data)
        .map_err(|e| TallyError::config(format!("invalid config {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("1m30s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration(" 10 ").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("0").unwrap(), Duration::ZERO);
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5 fortnights").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_parse_duration_overflow_is_an_error() {
        assert!(matches!(
            parse_duration("18446744073709551615h"),
            Err(TallyError::Config(_))
        ));
        assert!(matches!(
            parse_duration("99999999999999999999999"),
            Err(TallyError::Config(_))
        ));

        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, br#"{"poll_interval": "18446744073709551615h"}"#)
            .unwrap();
        assert!(matches!(
            AgentConfig::from_file(file.path()),
            Err(TallyError::Config(_))
        ));
    }

    #[test]
    fn test_parse_duration_list() {
        assert_eq!(
            parse_duration_list("1s, 3s,5s").unwrap(),
            vec![
                Duration::from_secs(1),
                Duration::from_secs(3),
                Duration::from_secs(5)
            ]
        );
        assert!(parse_duration_list("").unwrap().is_empty());
    }

    #[test]
    fn test_server_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.store_interval, Duration::from_secs(300));
        assert!(config.restore);
        assert_eq!(config.backoff_policy().max_attempts(), 4);
        config.validate().unwrap();
    }

    #[test]
    fn test_server_config_from_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"address": "0.0.0.0:9090", "store_interval": "1s", "restore": false,
                "backoff_intervals": ["1s", "250ms"]}"#,
        )
        .unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.address, "0.0.0.0:9090");
        assert_eq!(config.store_interval, Duration::from_secs(1));
        assert!(!config.restore);
        assert_eq!(
            config.backoff_intervals,
            vec![Duration::from_secs(1), Duration::from_millis(250)]
        );
        assert_eq!(config.shutdown_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_server_rejects_bad_subnet() {
        let config = ServerConfig {
            trusted_subnet: Some("10.0.0.0/99".to_string()),
            ..ServerConfig::default()
        };
        assert!(matches!(config.validate(), Err(TallyError::Config(_))));
    }

    #[test]
    fn test_agent_backoff_switch() {
        let config = AgentConfig {
            backoff: false,
            ..AgentConfig::default()
        };
        assert!(config.backoff_policy().is_disabled());
        assert_eq!(AgentConfig::default().backoff_policy().delays().len(), 3);
    }

    #[test]
    fn test_agent_validation() {
        AgentConfig::default().validate().unwrap();

        let config = AgentConfig {
            rate_limit: 0,
            ..AgentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transport_kind_parse() {
        assert_eq!("HTTP".parse::<TransportKind>().unwrap(), TransportKind::Http);
        assert_eq!("grpc".parse::<TransportKind>().unwrap(), TransportKind::Rpc);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
    }

    #[test]
    fn test_config_serializes_durations_as_text() {
        let json = serde_json::to_value(AgentConfig::default()).unwrap();
        assert_eq!(json["poll_interval"], "2s");
        assert_eq!(json["backoff_intervals"], serde_json::json!(["1s", "3s", "5s"]));
    }

    #[test]
    fn test_missing_config_file() {
        let result = AgentConfig::from_file("/nonexistent/tally.json");
        assert!(matches!(result, Err(TallyError::Config(_))));
    }
}
