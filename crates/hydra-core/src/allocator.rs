//! CPU, memory and GPU allocation.
//!
//! Limits are what the user asked for (or the configured default). Requests
//! are the limit divided by the over-commit rate, which lets the scheduler
//! pack more sandboxes onto a node than their limits would allow. A rate of
//! zero or one leaves requests equal to limits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::error;

use crate::config::HydraConfig;
use crate::quantity;

/// GPU driver and count for a device.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuSet {
    /// Resource key of the GPU driver.
    pub driver: String,
    /// Number of GPUs.
    pub count: u8,
}

impl GpuSet {
    /// Whether any GPU is requested.
    #[must_use]
    pub const fn is_gpu(&self) -> bool {
        self.count > 0
    }
}

/// Request and limit quantities for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequestSet {
    /// CPU request (`{n}m`).
    pub cpu_request: String,
    /// CPU limit (`{n}m`).
    pub cpu_limit: String,
    /// Memory request (`{n}Mi`).
    pub memory_request: String,
    /// Memory limit (`{n}Mi`).
    pub memory_limit: String,
    /// GPU driver and count, absent when no GPU is requested.
    pub gpu: Option<GpuSet>,
}

impl ResourceRequestSet {
    /// Request map keyed by resource name.
    #[must_use]
    pub fn requests(&self) -> BTreeMap<String, String> {
        self.resource_map(&self.cpu_request, &self.memory_request)
    }

    /// Limit map keyed by resource name.
    #[must_use]
    pub fn limits(&self) -> BTreeMap<String, String> {
        self.resource_map(&self.cpu_limit, &self.memory_limit)
    }

    fn resource_map(&self, cpu: &str, memory: &str) -> BTreeMap<String, String> {
        let mut map = BTreeMap::from([
            ("cpu".to_string(), cpu.to_string()),
            ("memory".to_string(), memory.to_string()),
        ]);
        if let Some(gpu) = &self.gpu {
            map.insert(gpu.driver.clone(), gpu.count.to_string());
        }
        map
    }
}

/// Compute `(request, limit)` for a CPU amount in millicores.
#[must_use]
pub fn compute_cpu(
    requested_milli: Option<u64>,
    default_milli: u64,
    overcommit_rate: u32,
) -> (u64, u64) {
    apply_overcommit(requested_milli.unwrap_or(default_milli), overcommit_rate)
}

/// Compute `(request, limit)` for a memory amount in MiB.
#[must_use]
pub fn compute_memory(
    requested_mebi: Option<u64>,
    default_mebi: u64,
    overcommit_rate: u32,
) -> (u64, u64) {
    apply_overcommit(requested_mebi.unwrap_or(default_mebi), overcommit_rate)
}

fn apply_overcommit(limit: u64, rate: u32) -> (u64, u64) {
    if rate > 1 {
        (limit / u64::from(rate), limit)
    } else {
        (limit, limit)
    }
}

/// Resolve the GPU driver and count for a device.
#[must_use]
pub fn build_gpu_set(
    device_gpu_count: u8,
    driver_override: &str,
    default_driver: &str,
    default_gpu_per_device: u8,
    use_default_when_zero: bool,
) -> GpuSet {
    let count = if device_gpu_count == 0 && use_default_when_zero {
        default_gpu_per_device
    } else {
        device_gpu_count
    };
    let driver = if driver_override.is_empty() {
        default_driver
    } else {
        driver_override
    };
    GpuSet {
        driver: driver.to_string(),
        count,
    }
}

/// Parse a user supplied amount. Unparsable values fall back to the default.
#[must_use]
pub fn parse_amount(raw: &str, what: &str) -> Option<u64> {
    if raw.is_empty() {
        return None;
    }
    match raw.parse::<u64>() {
        Ok(value) => Some(value),
        Err(_) => {
            error!(
                value = %raw,
                resource = %what,
                "Failed to parse amount, falling back to default"
            );
            None
        }
    }
}

/// Compute the full request set for a device.
#[must_use]
pub fn allocate(
    cpu: Option<u64>,
    memory: Option<u64>,
    gpu: &GpuSet,
    config: &HydraConfig,
) -> ResourceRequestSet {
    let (cpu_request, cpu_limit) =
        compute_cpu(cpu, config.default_cpu_per_device, config.cpu_overcommit_rate);
    let (memory_request, memory_limit) =
        compute_memory(memory, config.default_ram_per_device, config.memory_overcommit_rate);

    ResourceRequestSet {
        cpu_request: quantity::milli(cpu_request),
        cpu_limit: quantity::milli(cpu_limit),
        memory_request: quantity::mebi(memory_request),
        memory_limit: quantity::mebi(memory_limit),
        gpu: gpu.is_gpu().then(|| gpu.clone()),
    }
}
