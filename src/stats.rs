//! Container stats payload
//!
//! Typed view over the fields of a container engine's stats document that
//! the agent consumes. Everything else is kept in `extra` maps so documents
//! survive a decode/encode cycle without a schema for every remote field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// CPU time counters, in nanoseconds
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuUsage {
    pub total_usage: u64,
    pub usage_in_kernelmode: u64,
    pub usage_in_usermode: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStats {
    pub cpu_usage: CpuUsage,
    pub system_cpu_usage: u64,
    pub online_cpus: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStats {
    pub usage: u64,
    pub limit: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PidsStats {
    pub current: u64,
    pub limit: Option<u64>,
}

/// One stats sample of a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub read: Option<DateTime<Utc>>,
    pub preread: Option<DateTime<Utc>>,
    pub cpu_stats: CpuStats,
    pub precpu_stats: CpuStats,
    pub memory_stats: MemoryStats,
    pub pids_stats: PidsStats,
    pub num_procs: u64,
    /// Fields the agent does not interpret (networks, blkio_stats, ...)
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ContainerStats {
    /// Decode one JSON stats document
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::Decode(e.to_string()))
    }

    /// CPU usage between the previous and current sample, as a percentage
    /// of one CPU times the number of online CPUs.
    pub fn cpu_percent(&self) -> f64 {
        let cpu_delta = self
            .cpu_stats
            .cpu_usage
            .total_usage
            .saturating_sub(self.precpu_stats.cpu_usage.total_usage);
        let system_delta = self
            .cpu_stats
            .system_cpu_usage
            .saturating_sub(self.precpu_stats.system_cpu_usage);

        if cpu_delta == 0 || system_delta == 0 {
            return 0.0;
        }

        let cpus = self.cpu_stats.online_cpus.max(1) as f64;
        (cpu_delta as f64 / system_delta as f64) * cpus * 100.0
    }

    /// Memory usage as a percentage of the limit
    pub fn memory_percent(&self) -> f64 {
        if self.memory_stats.limit == 0 {
            return 0.0;
        }
        self.memory_stats.usage as f64 / self.memory_stats.limit as f64 * 100.0
    }
}
