//! The externally visible device representation.

use serde::{Deserialize, Serialize};

use crate::cluster::ObjectMeta;
use crate::labels;

/// Status reported right after a create call.
pub const STATUS_CREATING: &str = "Creating";

/// Status reported once deletion has been requested.
pub const STATUS_TERMINATING: &str = "Terminating";

/// Device type of a CPU-only sandbox.
pub const DEVICE_TYPE_CPU: &str = "cpu";

/// Device type of a sandbox holding GPUs.
pub const DEVICE_TYPE_GPU: &str = "gpu";

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero(value: &u8) -> bool {
    *value == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_zero_role(value: &u32) -> bool {
    *value == 0
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_false(value: &bool) -> bool {
    !*value
}

/// Requested and observed state of a user's sandbox.
///
/// Create requests use the same shape: `deviceCpu` in millicores,
/// `deviceRam` in MiB, both as decimal strings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceSpec {
    /// Name of the backing pod.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_name: String,
    /// Namespace of the backing pod.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_namespace: String,
    /// `cpu` or `gpu`.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_type: String,
    /// Pod IP.
    #[serde(rename = "deviceIP", skip_serializing_if = "String::is_empty")]
    pub device_ip: String,
    /// CPU amount.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_cpu: String,
    /// Memory amount.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_ram: String,
    /// GPU count.
    #[serde(skip_serializing_if = "is_zero")]
    pub device_gpu: u8,
    /// Runtime status.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_status: String,
    /// GPU resource key.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub gpu_driver: String,
    /// Owning user.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub open_hydra_username: String,
    /// Owner's role.
    #[serde(skip_serializing_if = "is_zero_role")]
    pub role: u32,
    /// Owner's display name.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub chinese_name: String,
    /// Queue position.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub line_no: String,
    /// Mount the public dataset.
    #[serde(skip_serializing_if = "is_false")]
    pub use_public_data_set: bool,
    /// Comma-separated reachable URLs.
    #[serde(rename = "sandboxURLs", skip_serializing_if = "String::is_empty")]
    pub sandbox_urls: String,
    /// Sandbox template.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub sandbox_name: String,
    /// Scheduling affinity passed through to the workload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,
    /// Tenant whose project directories are mounted.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub open_hydra_project_id: String,
}

/// A device; metadata labels on create requests become custom workload labels.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Device {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Specification and observed state.
    #[serde(default)]
    pub spec: DeviceSpec,
}

impl Device {
    /// Create request for `username` running `sandbox`.
    pub fn request(username: impl Into<String>, sandbox: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::default(),
            spec: DeviceSpec {
                open_hydra_username: username.into(),
                sandbox_name: sandbox.into(),
                ..Default::default()
            },
        }
    }

    /// Device reported after a delete call.
    #[must_use]
    pub fn terminating(username: &str) -> Self {
        Self {
            metadata: ObjectMeta::named(labels::device_name(username), ""),
            spec: DeviceSpec {
                open_hydra_username: username.to_string(),
                device_status: STATUS_TERMINATING.to_string(),
                ..Default::default()
            },
        }
    }

    /// Set the GPU count.
    #[must_use]
    pub const fn with_gpu(mut self, count: u8) -> Self {
        self.spec.device_gpu = count;
        self
    }

    /// Set CPU (millicores) and memory (MiB).
    #[must_use]
    pub fn with_resources(mut self, cpu: impl Into<String>, ram: impl Into<String>) -> Self {
        self.spec.device_cpu = cpu.into();
        self.spec.device_ram = ram.into();
        self
    }

    /// Add a custom label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    /// Owning user.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.spec.open_hydra_username
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        let mut device = Device::request("alice", "jupyter-lab").with_gpu(1);
        device.spec.device_ip = "10.0.0.1".to_string();
        device.spec.sandbox_urls = "http://localhost:30000".to_string();

        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["spec"]["openHydraUsername"], "alice");
        assert_eq!(json["spec"]["deviceIP"], "10.0.0.1");
        assert_eq!(json["spec"]["sandboxURLs"], "http://localhost:30000");
        assert_eq!(json["spec"]["deviceGpu"], 1);
        assert!(json["spec"].get("role").is_none());
        assert!(json["spec"].get("usePublicDataSet").is_none());
    }

    #[test]
    fn test_parse_create_request() {
        let device: Device = serde_json::from_str(
            r#"{"metadata": {"labels": {"team": "a"}},
                "spec": {
                    "openHydraUsername": "bob",
                    "sandboxName": "vscode",
                    "deviceCpu": "4000"
                }}"#,
        )
        .unwrap();
        assert_eq!(device.username(), "bob");
        assert_eq!(device.spec.device_cpu, "4000");
        assert_eq!(device.metadata.label("team"), Some("a"));
    }

    #[test]
    fn test_terminating() {
        let device = Device::terminating("carol");
        assert_eq!(device.metadata.name, "carol-device");
        assert_eq!(device.spec.device_status, STATUS_TERMINATING);
    }
}
