//! System metrics sampled for heartbeats.

use std::sync::Mutex;

use ds_protocol::DeviceMetrics;
use sysinfo::{Components, Disks, System};

/// Source of device metrics. Sampling may block; callers run it off the
/// async workers.
pub trait MetricsSampler: Send + Sync {
    fn sample(&self) -> DeviceMetrics;
}

/// Metrics from the running OS via `sysinfo`.
pub struct SystemMetrics {
    system: Mutex<System>,
}

impl SystemMetrics {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime it so the first real sample has a
        // baseline.
        system.refresh_cpu_usage();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SystemMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsSampler for SystemMetrics {
    fn sample(&self) -> DeviceMetrics {
        let (cpu_usage, memory_total, memory_used) = match self.system.lock() {
            Ok(mut system) => {
                system.refresh_cpu_usage();
                system.refresh_memory();
                (
                    f64::from(system.global_cpu_usage()),
                    system.total_memory(),
                    system.used_memory(),
                )
            }
            Err(_) => (0.0, 0, 0),
        };

        let (disk_total, disk_used) = root_disk_usage();

        DeviceMetrics {
            cpu_usage: round1(cpu_usage),
            memory_total,
            memory_used,
            memory_percent: percent(memory_used, memory_total),
            disk_total,
            disk_used,
            disk_percent: percent(disk_used, disk_total),
            cpu_temperature: cpu_temperature(),
        }
    }
}

/// Usage of the disk mounted at `/`, or of the largest disk if none is.
fn root_disk_usage() -> (u64, u64) {
    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .list()
        .iter()
        .find(|d| d.mount_point() == std::path::Path::new("/"))
        .or_else(|| disks.list().iter().max_by_key(|d| d.total_space()));
    match disk {
        Some(d) => {
            let total = d.total_space();
            (total, total.saturating_sub(d.available_space()))
        }
        None => (0, 0),
    }
}

/// Prefers a sensor labelled as the CPU; falls back to the first sensor with
/// a reading.
fn cpu_temperature() -> Option<f64> {
    let components = Components::new_with_refreshed_list();
    let reading = components
        .list()
        .iter()
        .filter(|c| c.label().to_ascii_lowercase().contains("cpu"))
        .find_map(|c| c.temperature())
        .or_else(|| components.list().iter().find_map(|c| c.temperature()))?;
    Some(round1(f64::from(reading)))
}

fn percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    round1(used as f64 / total as f64 * 100.0)
}

fn round1(v: f64) -> f64 {
    (v * 10.0).round() / 10.0
}

/// Returns the same metrics every time.
#[cfg(any(test, feature = "test-support"))]
pub struct FixedMetrics(pub DeviceMetrics);

#[cfg(any(test, feature = "test-support"))]
impl FixedMetrics {
    pub fn zeroed() -> Self {
        Self(DeviceMetrics {
            cpu_usage: 0.0,
            memory_total: 0,
            memory_used: 0,
            memory_percent: 0.0,
            disk_total: 0,
            disk_used: 0,
            disk_percent: 0.0,
            cpu_temperature: None,
        })
    }
}

#[cfg(any(test, feature = "test-support"))]
impl MetricsSampler for FixedMetrics {
    fn sample(&self) -> DeviceMetrics {
        self.0.clone()
    }
}
