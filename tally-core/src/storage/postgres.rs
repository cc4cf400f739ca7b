/*!
Postgres storage engine.

Gauges and counters live in two tables keyed by metric id. Every statement
runs under the configured backoff policy; connection-class failures are
retried, everything else is returned immediately.
*/

use super::MetricStorage;
use crate::metric::{Metric, MetricKind, MetricValue};
use crate::{Result, TallyError};
use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;
use tally_retry::{with_backoff, BackoffPolicy, ErrorClass};
use tracing::{debug, error, info};

const CREATE_GAUGES: &str = "CREATE TABLE IF NOT EXISTS gauges (
    id TEXT PRIMARY KEY,
    value DOUBLE PRECISION NOT NULL
)";

const CREATE_COUNTERS: &str = "CREATE TABLE IF NOT EXISTS counters (
    id TEXT PRIMARY KEY,
    delta BIGINT NOT NULL
)";

const UPSERT_GAUGE: &str = "INSERT INTO gauges (id, value) VALUES ($1, $2)
    ON CONFLICT (id) DO UPDATE SET value = excluded.value";

const UPSERT_COUNTER: &str = "INSERT INTO counters (id, delta) VALUES ($1, $2)
    ON CONFLICT (id) DO UPDATE SET delta = counters.delta + excluded.delta";

/// Postgres-backed metric storage
///
/// # Example
/// ```rust,no_run
/// use tally_core::storage::PgStorage;
/// use tally_retry::BackoffPolicy;
///
/// # async fn run() -> tally_core::Result<()> {
/// let storage = PgStorage::connect("postgres://tally@localhost/tally", BackoffPolicy::default())?;
/// storage.bootstrap().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PgStorage {
    pool: PgPool,
    backoff: BackoffPolicy,
}

impl PgStorage {
    /// Create a lazily-connecting pool for `dsn`
    ///
    /// # Errors
    /// Returns a configuration error if the connection string cannot be parsed.
    pub fn connect(dsn: &str, backoff: BackoffPolicy) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect_lazy(dsn)
            .map_err(|e| TallyError::config(format!("invalid database DSN: {e}")))?;

        info!("Initialized Postgres storage");
        Ok(Self { pool, backoff })
    }

    /// Create the metric tables if they do not exist yet
    pub async fn bootstrap(&self) -> Result<()> {
        for statement in [CREATE_GAUGES, CREATE_COUNTERS] {
            self.retry("pg_bootstrap", || async {
                sqlx::query(statement).execute(&self.pool).await.map(|_| ())
            })
            .await?;
        }
        info!("Postgres schema is ready");
        Ok(())
    }

    /// Close every pooled connection
    pub async fn close(&self) {
        self.pool.close().await;
        debug!("Postgres pool closed");
    }

    async fn retry<T, F, Fut>(&self, op_name: &'static str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        with_backoff(op_name, &self.backoff, classify_sqlx_error, |_attempt| op())
            .await
            .map_err(|e| {
                error!(operation = op_name, error = %e, "Postgres operation failed");
                storage_error(op_name, e)
            })
    }

    async fn upsert(tx: &mut Transaction<'_, Postgres>, metric: &Metric) -> sqlx::Result<()> {
        match metric.value {
            MetricValue::Gauge(v) => {
                sqlx::query(UPSERT_GAUGE)
                    .bind(&metric.id)
                    .bind(v)
                    .execute(&mut **tx)
                    .await?;
            }
            MetricValue::Counter(d) => {
                sqlx::query(UPSERT_COUNTER)
                    .bind(&metric.id)
                    .bind(d)
                    .execute(&mut **tx)
                    .await?;
            }
        }
        Ok(())
    }

    async fn apply_batch(&self, batch: &[Metric]) -> sqlx::Result<()> {
        let mut tx = self.pool.begin().await?;
        for metric in batch {
            Self::upsert(&mut tx, metric).await?;
        }
        tx.commit().await
    }
}

/// SQLSTATE `numeric_value_out_of_range`, raised when a BIGINT counter overflows
const NUMERIC_VALUE_OUT_OF_RANGE: &str = "22003";

fn storage_error(op_name: &str, err: sqlx::Error) -> TallyError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some(NUMERIC_VALUE_OUT_OF_RANGE) {
            return TallyError::validation(format!("{op_name}: counter would overflow"));
        }
    }
    TallyError::storage(format!("{op_name}: {err}"))
}

/// Connection-class failures are transient; query, constraint and decode
/// errors will fail the same way again.
fn classify_sqlx_error(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => ErrorClass::Transient,
        _ => ErrorClass::Fatal,
    }
}

#[async_trait]
impl MetricStorage for PgStorage {
    async fn add(&self, metric: Metric) -> Result<()> {
        let batch = std::slice::from_ref(&metric);
        self.retry("pg_add", || self.apply_batch(batch)).await
    }

    async fn get(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        let found = match kind {
            MetricKind::Gauge => self
                .retry("pg_get_gauge", || async {
                    sqlx::query_scalar::<_, f64>("SELECT value FROM gauges WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                })
                .await?
                .map(|v| Metric::gauge(id, v)),
            MetricKind::Counter => self
                .retry("pg_get_counter", || async {
                    sqlx::query_scalar::<_, i64>("SELECT delta FROM counters WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await
                })
                .await?
                .map(|d| Metric::counter(id, d)),
        };
        found.ok_or_else(|| TallyError::not_found(kind, id))
    }

    async fn list(&self) -> Result<Vec<Metric>> {
        let gauges = self
            .retry("pg_list_gauges", || async {
                sqlx::query("SELECT id, value FROM gauges")
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;
        let counters = self
            .retry("pg_list_counters", || async {
                sqlx::query("SELECT id, delta FROM counters")
                    .fetch_all(&self.pool)
                    .await
            })
            .await?;

        let mut metrics = Vec::with_capacity(gauges.len() + counters.len());
        for row in gauges {
            let id: String = row.try_get("id").map_err(decode_error)?;
            let value: f64 = row.try_get("value").map_err(decode_error)?;
            metrics.push(Metric::gauge(id, value));
        }
        for row in counters {
            let id: String = row.try_get("id").map_err(decode_error)?;
            let delta: i64 = row.try_get("delta").map_err(decode_error)?;
            metrics.push(Metric::counter(id, delta));
        }
        Ok(metrics)
    }

    async fn bulk_add(&self, batch: &[Metric]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.retry("pg_bulk_add", || self.apply_batch(batch)).await
    }

    async fn ping(&self) -> bool {
        match sqlx::query("SELECT 1").execute(&self.pool).await {
            Ok(_) => true,
            Err(e) => {
                error!(error = %e, "database ping failed");
                false
            }
        }
    }
}

fn decode_error(err: sqlx::Error) -> TallyError {
    TallyError::storage(format!("failed to decode metric row: {err}"))
}
