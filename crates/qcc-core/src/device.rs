//! Device resource discovery: the capacity the allocator may hand out.

use serde::{Deserialize, Serialize};

use crate::resources::ResourceBudget;

/// Storage reserved for cells when the platform gives no better figure.
const DEFAULT_STORAGE_MB: u64 = 51_200;
/// Network budget shared by all cells.
const DEFAULT_NETWORK_MBPS: u64 = 1_000;

/// Discovered hardware totals of the current device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceResources {
    /// Total system RAM in MB.
    pub total_memory_mb: u64,
    /// Available system RAM in MB at discovery time.
    pub available_memory_mb: u64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl DeviceResources {
    /// Discover hardware totals of the current system.
    pub fn discover() -> Self {
        let total_memory_mb = Self::meminfo_kb("MemTotal:").map(|kb| kb / 1024).unwrap_or(0);
        let available_memory_mb = Self::meminfo_kb("MemAvailable:")
            .map(|kb| kb / 1024)
            .unwrap_or(total_memory_mb / 2);

        Self {
            total_memory_mb,
            available_memory_mb,
            cpu_cores: num_cpus(),
        }
    }

    /// Capacity the allocator enforces: the configured override, else what is available.
    pub fn capacity(&self, override_budget: Option<ResourceBudget>) -> ResourceBudget {
        if let Some(budget) = override_budget {
            return budget;
        }
        ResourceBudget {
            memory_mb: self.available_memory_mb,
            cpu_percent: self.cpu_cores as u64 * 100,
            storage_mb: DEFAULT_STORAGE_MB,
            network_mbps: DEFAULT_NETWORK_MBPS,
        }
    }

    fn meminfo_kb(key: &str) -> Option<u64> {
        #[cfg(target_os = "linux")]
        {
            let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
            meminfo
                .lines()
                .find(|line| line.starts_with(key))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = key;
            None
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
