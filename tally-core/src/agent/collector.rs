/*!
Metric collection for the agent.

Each poll tick writes three groups of readings into the agent's buffer:
the poll counter with a random gauge, statistics of the agent process, and
host memory and per-CPU utilisation.
*/

use crate::metric::Metric;
use crate::storage::MemStorage;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, System};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Polls the process and host and merges readings into a buffer
pub struct Collector {
    buffer: Arc<MemStorage>,
    system: System,
    pid: Option<Pid>,
}

impl Collector {
    pub fn new(buffer: Arc<MemStorage>) -> Self {
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => Some(pid),
            Err(e) => {
                warn!(error = e, "Cannot determine own pid, process metrics disabled");
                None
            }
        };
        Self {
            buffer,
            system: System::new(),
            pid,
        }
    }

    /// `PollCount` counter and `RandomValue` gauge
    pub fn collect_basic(&self) -> Vec<Metric> {
        vec![
            Metric::counter("PollCount", 1),
            Metric::gauge("RandomValue", rand::thread_rng().gen::<f64>()),
        ]
    }

    /// Memory, CPU and disk I/O of this process
    pub fn collect_runtime(&mut self) -> Vec<Metric> {
        let Some(pid) = self.pid else {
            return Vec::new();
        };
        if !self
            .system
            .refresh_process_specifics(pid, ProcessRefreshKind::everything())
        {
            return Vec::new();
        }
        let Some(process) = self.system.process(pid) else {
            return Vec::new();
        };

        let disk = process.disk_usage();
        vec![
            Metric::gauge("ProcessResidentMemory", process.memory() as f64),
            Metric::gauge("ProcessVirtualMemory", process.virtual_memory() as f64),
            Metric::gauge("ProcessCpuUsage", process.cpu_usage() as f64),
            Metric::gauge("ProcessDiskReadBytes", disk.total_read_bytes as f64),
            Metric::gauge("ProcessDiskWrittenBytes", disk.total_written_bytes as f64),
        ]
    }

    /// Host memory and per-CPU utilisation (`CPUutilization1`, ...)
    pub fn collect_host(&mut self) -> Vec<Metric> {
        self.system.refresh_memory();
        self.system.refresh_cpu();

        let mut metrics = vec![
            Metric::gauge("TotalMemory", self.system.total_memory() as f64),
            Metric::gauge("FreeMemory", self.system.free_memory() as f64),
            Metric::gauge("UsedMemory", self.system.used_memory() as f64),
        ];
        metrics.extend(self.system.cpus().iter().enumerate().map(|(i, cpu)| {
            Metric::gauge(format!("CPUutilization{}", i + 1), cpu.cpu_usage() as f64)
        }));
        metrics
    }

    /// Run one poll tick and merge the readings into the buffer
    pub fn poll(&mut self) -> usize {
        let mut metrics = self.collect_basic();
        metrics.extend(self.collect_runtime());
        metrics.extend(self.collect_host());

        for metric in &metrics {
            if let Err(e) = self.buffer.apply(metric) {
                warn!(metric = %metric.id, error = %e, "Dropped reading");
            }
        }
        metrics.len()
    }

    /// Poll every `interval` until `cancel` fires
    pub async fn run(mut self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = interval.as_millis() as u64, "Collector started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let count = self.poll();
                    debug!(metrics = count, "Collected metrics");
                }
            }
        }
        info!("Collector stopped");
    }
}
