/*!
In-memory storage engine.
*/

use super::MetricStorage;
use crate::metric::{Metric, MetricKind, MetricValue};
use crate::{Result, TallyError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Default)]
struct Maps {
    gauges: HashMap<String, f64>,
    counters: HashMap<String, i64>,
}

impl Maps {
    /// Merge a batch; nothing changes if any counter would overflow
    fn apply(&mut self, batch: &[Metric]) -> Result<()> {
        let mut totals: HashMap<&str, i64> = HashMap::new();
        for metric in batch {
            if let MetricValue::Counter(d) = metric.value {
                let current = match totals.get(metric.id.as_str()) {
                    Some(total) => *total,
                    None => self.counters.get(&metric.id).copied().unwrap_or(0),
                };
                let total = current
                    .checked_add(d)
                    .ok_or_else(|| TallyError::counter_overflow(&metric.id))?;
                totals.insert(&metric.id, total);
            }
        }

        for metric in batch {
            if let MetricValue::Gauge(v) = metric.value {
                self.gauges.insert(metric.id.clone(), v);
            }
        }
        for (id, total) in totals {
            self.counters.insert(id.to_string(), total);
        }
        Ok(())
    }
}

/// Gauge and counter maps guarded by one exclusive lock
///
/// The lock is only ever held for a single map operation and never across
/// an await point, so a blocking mutex is fine inside async code.
///
/// # Example
/// ```rust
/// use tally_core::{Metric, MemStorage};
///
/// let storage = MemStorage::new();
/// storage.apply(&Metric::counter("PollCount", 1))?;
/// storage.apply(&Metric::counter("PollCount", 2))?;
/// assert_eq!(storage.len(), 1);
/// # Ok::<(), tally_core::TallyError>(())
/// ```
#[derive(Debug, Default)]
pub struct MemStorage {
    maps: Mutex<Maps>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Maps> {
        // A panic while holding the lock cannot leave the maps half-updated.
        self.maps.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Synchronous merge, for writers that are not async (the collector)
    ///
    /// # Errors
    ///
    /// Returns a validation error when a counter would leave the `i64` range.
    pub fn apply(&self, metric: &Metric) -> Result<()> {
        self.lock().apply(std::slice::from_ref(metric))
    }

    /// Number of distinct metrics across both kinds
    pub fn len(&self) -> usize {
        let maps = self.lock();
        maps.gauges.len() + maps.counters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Owned copy of the current state
    pub fn snapshot(&self) -> Vec<Metric> {
        let maps = self.lock();
        let gauges = maps.gauges.iter().map(|(id, v)| Metric::gauge(id.clone(), *v));
        let counters = maps
            .counters
            .iter()
            .map(|(id, d)| Metric::counter(id.clone(), *d));
        gauges.chain(counters).collect()
    }
}

#[async_trait]
impl MetricStorage for MemStorage {
    async fn add(&self, metric: Metric) -> Result<()> {
        self.apply(&metric)
    }

    async fn get(&self, kind: MetricKind, id: &str) -> Result<Metric> {
        let maps = self.lock();
        let found = match kind {
            MetricKind::Gauge => maps.gauges.get(id).map(|v| Metric::gauge(id, *v)),
            MetricKind::Counter => maps.counters.get(id).map(|d| Metric::counter(id, *d)),
        };
        found.ok_or_else(|| TallyError::not_found(kind, id))
    }

    async fn list(&self) -> Result<Vec<Metric>> {
        Ok(self.snapshot())
    }

    async fn bulk_add(&self, batch: &[Metric]) -> Result<()> {
        self.lock().apply(batch)
    }

    async fn ping(&self) -> bool {
        true
    }
}
