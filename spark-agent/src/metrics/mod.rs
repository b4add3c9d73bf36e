//! Host and GPU metrics for diagnostics
//!
//! Provides point-in-time snapshots:
//! - CPU usage and load averages
//! - Memory usage statistics (unified memory on GB10)
//! - Disk usage for mounted filesystems, including the model cache
//! - Per-GPU state from `nvidia-smi --query-gpu`

use crate::execution::{CommandRunner, CommandSpec};
use anyhow::Result;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use sysinfo::{Disks, System};
use tracing::debug;

/// Fields requested from `nvidia-smi --query-gpu`, in column order
pub const GPU_QUERY_FIELDS: &str = "index,name,temperature.gpu,utilization.gpu,memory.used,memory.total,power.draw";

#[derive(Debug, Serialize)]
pub struct SystemMetrics {
    pub uptime_seconds: u64,
    pub cpu: CpuMetrics,
    pub memory: MemoryMetrics,
    pub disk: Vec<DiskMetrics>,
}

#[derive(Debug, Serialize)]
pub struct CpuMetrics {
    pub percent: f32,
    pub load_avg: [f64; 3], // [1min, 5min, 15min]
    pub core_count: usize,
}

#[derive(Debug, Serialize)]
pub struct MemoryMetrics {
    pub total_mb: u64,
    pub used_mb: u64,
    pub available_mb: u64,
    pub percent_used: f32,
}

#[derive(Debug, Serialize)]
pub struct DiskMetrics {
    pub path: String,
    pub total_gb: f64,
    pub used_gb: f64,
    pub free_gb: f64,
    pub percent_used: f32,
}

/// One row of `nvidia-smi --query-gpu`; GB10 reports `[N/A]` for some fields
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuMetrics {
    pub index: u32,
    pub name: String,
    pub temperature_c: Option<f32>,
    pub utilization_percent: Option<f32>,
    pub memory_used_mb: Option<u64>,
    pub memory_total_mb: Option<u64>,
    pub power_draw_w: Option<f32>,
}

impl SystemMetrics {
    pub async fn collect() -> Result<Self> {
        debug!("Collecting system metrics...");

        let mut sys = System::new_all();
        sys.refresh_all();

        // Wait a moment for accurate CPU readings
        tokio::time::sleep(Duration::from_millis(200)).await;
        sys.refresh_cpu_usage();

        Ok(SystemMetrics {
            uptime_seconds: System::uptime(),
            cpu: CpuMetrics::collect(&sys),
            memory: MemoryMetrics::collect(&sys),
            disk: DiskMetrics::collect(),
        })
    }

    /// Disk holding `path` (longest matching mount point)
    pub fn disk_for(&self, path: &Path) -> Option<&DiskMetrics> {
        self.disk
            .iter()
            .filter(|d| path.starts_with(&d.path))
            .max_by_key(|d| d.path.len())
    }
}

impl CpuMetrics {
    fn collect(sys: &System) -> Self {
        let load = System::load_average();
        CpuMetrics {
            percent: sys.global_cpu_info().cpu_usage(),
            load_avg: [load.one, load.five, load.fifteen],
            core_count: sys.cpus().len(),
        }
    }
}

impl MemoryMetrics {
    fn collect(sys: &System) -> Self {
        let total_bytes = sys.total_memory();
        let available_bytes = sys.available_memory();
        let used_bytes = total_bytes.saturating_sub(available_bytes);

        let percent_used = if total_bytes > 0 {
            (used_bytes as f32 / total_bytes as f32) * 100.0
        } else {
            0.0
        };

        MemoryMetrics {
            total_mb: total_bytes / (1024 * 1024),
            used_mb: used_bytes / (1024 * 1024),
            available_mb: available_bytes / (1024 * 1024),
            percent_used,
        }
    }
}

impl DiskMetrics {
    fn collect() -> Vec<Self> {
        const GB: f64 = 1024.0 * 1024.0 * 1024.0;

        Disks::new_with_refreshed_list()
            .list()
            .iter()
            .filter(|disk| disk.total_space() > 0)
            .map(|disk| {
                let total = disk.total_space() as f64;
                let free = disk.available_space() as f64;
                let used = (total - free).max(0.0);
                DiskMetrics {
                    path: disk.mount_point().to_string_lossy().to_string(),
                    total_gb: total / GB,
                    used_gb: used / GB,
                    free_gb: free / GB,
                    percent_used: ((used / total) * 100.0) as f32,
                }
            })
            .collect()
    }
}

impl GpuMetrics {
    /// Query every GPU through `runner`
    pub async fn collect(runner: &dyn CommandRunner) -> Result<Vec<Self>> {
        let query = format!("--query-gpu={}", GPU_QUERY_FIELDS);
        let spec = CommandSpec::new("nvidia-smi", [query.as_str(), "--format=csv,noheader,nounits"])
            .with_timeout(Duration::from_secs(15));
        let output = runner.run(&spec).await.into_stdout("nvidia-smi query")?;
        Ok(parse_gpu_query(&output))
    }
}

pub fn parse_gpu_query(output: &str) -> Vec<GpuMetrics> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 7 {
                return None;
            }
            Some(GpuMetrics {
                index: fields[0].parse().ok()?,
                name: fields[1].to_string(),
                temperature_c: number(fields[2]),
                utilization_percent: number(fields[3]),
                memory_used_mb: number(fields[4]),
                memory_total_mb: number(fields[5]),
                power_draw_w: number(fields[6]),
            })
        })
        .collect()
}

fn number<T: std::str::FromStr>(field: &str) -> Option<T> {
    field.parse().ok()
}
