//! Resource budgets: the shape of both a reservation request and a grant.

use std::fmt;
use std::iter::Sum;

use serde::{Deserialize, Serialize};

/// Memory, CPU, storage and network amounts along four independent dimensions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceBudget {
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub cpu_percent: u64,
    #[serde(default)]
    pub storage_mb: u64,
    #[serde(default)]
    pub network_mbps: u64,
}

impl ResourceBudget {
    pub const ZERO: ResourceBudget = ResourceBudget {
        memory_mb: 0,
        cpu_percent: 0,
        storage_mb: 0,
        network_mbps: 0,
    };

    pub const fn new(memory_mb: u64, cpu_percent: u64, storage_mb: u64, network_mbps: u64) -> Self {
        Self {
            memory_mb,
            cpu_percent,
            storage_mb,
            network_mbps,
        }
    }

    /// Baseline requirement for a capability when its descriptor declares none.
    pub fn default_for_capability(capability: &str) -> Self {
        match capability {
            "text_generation" => Self::new(512, 100, 100, 0),
            "media_processing" => Self::new(1024, 200, 500, 0),
            "ui_rendering" => Self::new(384, 100, 100, 0),
            "data_analysis" => Self::new(768, 150, 100, 0),
            _ => Self::new(256, 50, 100, 0),
        }
    }

    pub fn saturating_add(self, other: Self) -> Self {
        Self {
            memory_mb: self.memory_mb.saturating_add(other.memory_mb),
            cpu_percent: self.cpu_percent.saturating_add(other.cpu_percent),
            storage_mb: self.storage_mb.saturating_add(other.storage_mb),
            network_mbps: self.network_mbps.saturating_add(other.network_mbps),
        }
    }

    pub fn saturating_sub(self, other: Self) -> Self {
        Self {
            memory_mb: self.memory_mb.saturating_sub(other.memory_mb),
            cpu_percent: self.cpu_percent.saturating_sub(other.cpu_percent),
            storage_mb: self.storage_mb.saturating_sub(other.storage_mb),
            network_mbps: self.network_mbps.saturating_sub(other.network_mbps),
        }
    }

    /// True when every dimension of `self` is at most the same dimension of `limit`.
    pub fn fits_within(&self, limit: &Self) -> bool {
        self.memory_mb <= limit.memory_mb
            && self.cpu_percent <= limit.cpu_percent
            && self.storage_mb <= limit.storage_mb
            && self.network_mbps <= limit.network_mbps
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl Sum for ResourceBudget {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Self::saturating_add)
    }
}

impl<'a> Sum<&'a ResourceBudget> for ResourceBudget {
    fn sum<I: Iterator<Item = &'a ResourceBudget>>(iter: I) -> Self {
        iter.copied().sum()
    }
}

impl fmt::Display for ResourceBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}MB mem / {}% cpu / {}MB storage / {}Mbps net",
            self.memory_mb, self.cpu_percent, self.storage_mb, self.network_mbps
        )
    }
}
