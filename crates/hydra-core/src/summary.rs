//! Cluster-wide GPU accounting.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::cluster::{Node, ObjectMeta, Pod, PodPhase};
use crate::config::HydraConfig;
use crate::quantity;

/// Allocation of one GPU resource key.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuResourceSumUp {
    /// Requested by pods.
    pub allocated: i64,
    /// Offered by nodes.
    pub allocatable: i64,
}

/// Summary numbers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SumUpSpec {
    /// Devices that still fit at the default GPU count.
    pub pod_allocatable: i64,
    /// Pods holding at least one GPU.
    pub pod_allocated: usize,
    /// Total GPUs offered.
    pub gpu_allocatable: String,
    /// Total GPUs requested.
    pub gpu_allocated: String,
    /// Default CPU of a device.
    pub default_cpu_per_device: String,
    /// Default memory of a device.
    pub default_ram_per_device: String,
    /// Default GPU count of a device.
    pub default_gpu_per_device: u8,
    /// Pods still pending.
    pub total_line: usize,
    /// Per resource key breakdown.
    pub gpu_resource_sum_up: BTreeMap<String, GpuResourceSumUp>,
}

/// Resource summary.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SumUp {
    /// Metadata; carries the computation time.
    pub metadata: ObjectMeta,
    /// Numbers.
    pub spec: SumUpSpec,
}

fn amount(resources: &BTreeMap<String, String>, key: &str) -> i64 {
    resources.get(key).and_then(|q| quantity::parse_count(q)).unwrap_or_default()
}

/// Aggregate GPU capacity over `nodes` and requests over `pods`.
///
/// `default_gpu_per_device` is passed separately because it can be changed
/// at runtime.
#[must_use]
pub fn summarize(
    pods: &[Pod],
    nodes: &[Node],
    config: &HydraConfig,
    default_gpu_per_device: u8,
) -> SumUp {
    let mut per_key: BTreeMap<String, GpuResourceSumUp> = BTreeMap::new();
    let mut pod_allocated = 0;
    let mut total_line = 0;

    if config.gpu_resource_keys.is_empty() {
        warn!("No GPU resource keys configured, reporting zero GPU capacity");
    } else {
        for key in &config.gpu_resource_keys {
            let entry = per_key.entry(key.clone()).or_default();
            entry.allocatable = nodes.iter().map(|n| amount(&n.allocatable, key)).sum();
        }

        for pod in pods {
            let mut holds_gpu = false;
            for container in &pod.spec.containers {
                for key in &config.gpu_resource_keys {
                    let requested = amount(&container.resources.requests, key);
                    if requested > 0 {
                        holds_gpu = true;
                    }
                    per_key.entry(key.clone()).or_default().allocated += requested;
                }
            }
            if holds_gpu {
                pod_allocated += 1;
            }
            if pod.status.phase == PodPhase::Pending {
                total_line += 1;
            }
        }
    }

    let total_allocatable: i64 = per_key.values().map(|s| s.allocatable).sum();
    let total_allocated: i64 = per_key.values().map(|s| s.allocated).sum();
    let pod_allocatable = if default_gpu_per_device == 0 {
        0
    } else {
        total_allocatable / i64::from(default_gpu_per_device)
    };

    SumUp {
        metadata: ObjectMeta {
            creation_timestamp: Some(Utc::now()),
            ..Default::default()
        },
        spec: SumUpSpec {
            pod_allocatable,
            pod_allocated,
            gpu_allocatable: total_allocatable.to_string(),
            gpu_allocated: total_allocated.to_string(),
            default_cpu_per_device: quantity::canonical_milli(config.default_cpu_per_device),
            default_ram_per_device: quantity::canonical_mebi(config.default_ram_per_device),
            default_gpu_per_device,
            total_line,
            gpu_resource_sum_up: per_key,
        },
    }
}
