//! Provisioning configuration.
//!
//! [`HydraConfig`] holds every tunable of the device path: default resource
//! sizes, over-commit rates, GPU driver allow-list, host mount roots and the
//! URL composition settings used by the device view.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default namespace all sandboxes live in.
pub const DEFAULT_NAMESPACE: &str = "open-hydra";

/// Default name of the config object carrying the plugin catalog.
pub const DEFAULT_PLUGIN_CONFIG_NAME: &str = "openhydra-plugin";

/// Default key inside the plugin config object.
pub const DEFAULT_PLUGIN_CONFIG_KEY: &str = "plugins";

/// Default GPU driver resource key.
pub const DEFAULT_GPU_DRIVER: &str = "nvidia.com/gpu";

/// Ingress base-URL settings used when composing sandbox URLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct IngressConfig {
    /// Route sandbox URLs through the ingress port instead of node ports.
    pub enable_base_url: bool,
    /// Port the ingress listens on.
    pub port: u16,
    /// Port name to URL suffix mapping, e.g. `jupyter-lab` to `lab`.
    pub port_name_mapping: BTreeMap<String, String>,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            enable_base_url: false,
            port: 30006,
            port_name_mapping: BTreeMap::from([("jupyter-lab".to_string(), "lab".to_string())]),
        }
    }
}

/// Configuration for device provisioning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HydraConfig {
    /// Namespace every workload and endpoint is created in.
    pub namespace: String,
    /// Name of the config object holding the plugin catalog.
    pub plugin_config_name: String,
    /// Key of the plugin catalog document inside the config object.
    pub plugin_config_key: String,
    /// Default CPU per device in millicores.
    pub default_cpu_per_device: u64,
    /// Default memory per device in MiB.
    pub default_ram_per_device: u64,
    /// Default GPU count per device.
    pub default_gpu_per_device: u8,
    /// GPU driver used when a request names none.
    pub default_gpu_driver: String,
    /// Allow-list of GPU driver resource keys.
    pub gpu_resource_keys: Vec<String>,
    /// Comma separated list of addresses sandboxes are reachable at.
    pub server_ip: String,
    /// Divisor applied to CPU requests.
    pub cpu_overcommit_rate: u32,
    /// Divisor applied to memory requests.
    pub memory_overcommit_rate: u32,
    /// Maximum number of ports a sandbox template may expose.
    pub maximum_ports_per_sandbox: usize,
    /// Host root for per-user workspaces.
    pub workspace_path: PathBuf,
    /// Host root of the shared public datasets.
    pub public_dataset_base_path: String,
    /// Host root of the shared public courses.
    pub public_course_base_path: String,
    /// Host root of per-project datasets.
    pub project_dataset_base_path: PathBuf,
    /// Host root of per-project courses.
    pub project_course_base_path: PathBuf,
    /// Container path project datasets are mounted at.
    pub project_dataset_mount_path: String,
    /// Container path project courses are mounted at.
    pub project_course_mount_path: String,
    /// Mount per-project resources when a project id is given.
    pub add_project_resource: bool,
    /// Use `default_gpu_per_device` when a request asks for zero GPUs.
    pub use_default_gpu_when_zero: bool,
    /// Also delete replica sets and pods when a device is deleted.
    pub patch_resource_not_release: bool,
    /// Skip authentication, authorization and ownership checks.
    pub disable_auth: bool,
    /// Ingress URL settings.
    pub ingress: IngressConfig,
}

impl Default for HydraConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            plugin_config_name: DEFAULT_PLUGIN_CONFIG_NAME.to_string(),
            plugin_config_key: DEFAULT_PLUGIN_CONFIG_KEY.to_string(),
            default_cpu_per_device: 2000,
            default_ram_per_device: 8192,
            default_gpu_per_device: 0,
            default_gpu_driver: DEFAULT_GPU_DRIVER.to_string(),
            gpu_resource_keys: vec![DEFAULT_GPU_DRIVER.to_string(), "amd.com/gpu".to_string()],
            server_ip: "localhost".to_string(),
            cpu_overcommit_rate: 1,
            memory_overcommit_rate: 1,
            maximum_ports_per_sandbox: 3,
            workspace_path: PathBuf::from("/mnt/workspace"),
            public_dataset_base_path: "/mnt/public-dataset".to_string(),
            public_course_base_path: "/mnt/public-course".to_string(),
            project_dataset_base_path: PathBuf::from("/mnt/project-dataset"),
            project_course_base_path: PathBuf::from("/mnt/project-course"),
            project_dataset_mount_path: "/root/notebook/dataset-project".to_string(),
            project_course_mount_path: "/root/notebook/course-project".to_string(),
            add_project_resource: false,
            use_default_gpu_when_zero: false,
            patch_resource_not_release: false,
            disable_auth: false,
            ingress: IngressConfig::default(),
        }
    }
}

impl HydraConfig {
    /// Set the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Set the server address list.
    #[must_use]
    pub fn with_server_ip(mut self, server_ip: impl Into<String>) -> Self {
        self.server_ip = server_ip.into();
        self
    }

    /// Set the CPU and memory over-commit rates.
    #[must_use]
    pub const fn with_overcommit(mut self, cpu: u32, memory: u32) -> Self {
        self.cpu_overcommit_rate = cpu;
        self.memory_overcommit_rate = memory;
        self
    }

    /// Set the default GPU count per device.
    #[must_use]
    pub const fn with_default_gpu_per_device(mut self, gpu: u8) -> Self {
        self.default_gpu_per_device = gpu;
        self
    }

    /// Set the GPU driver allow-list.
    #[must_use]
    pub fn with_gpu_resource_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.gpu_resource_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Set the host workspace root.
    #[must_use]
    pub fn with_workspace_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.workspace_path = path.into();
        self
    }

    /// Disable or enable authentication.
    #[must_use]
    pub const fn with_disable_auth(mut self, disable: bool) -> Self {
        self.disable_auth = disable;
        self
    }

    /// Set the ingress settings.
    #[must_use]
    pub fn with_ingress(mut self, ingress: IngressConfig) -> Self {
        self.ingress = ingress;
        self
    }

    /// Whether a GPU driver is in the allow-list.
    #[must_use]
    pub fn is_gpu_driver_allowed(&self, driver: &str) -> bool {
        self.gpu_resource_keys.iter().any(|k| k == driver)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if a required value is empty.
    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(Error::Config("namespace cannot be empty".to_string()));
        }
        if self.plugin_config_name.is_empty() || self.plugin_config_key.is_empty() {
            return Err(Error::Config(
                "plugin config name and key cannot be empty".to_string(),
            ));
        }
        if self.server_ip.is_empty() {
            return Err(Error::Config("server ip cannot be empty".to_string()));
        }
        Ok(())
    }
}
