//! Sandbox template catalog.
//!
//! The catalog is a JSON document stored in a cluster config object. It maps
//! sandbox names to templates describing images, ports, volumes and the
//! command to run. Parsing is strict: unknown shapes fail, absent optional
//! fields default to empty.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A named port exposed by a sandbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxPort {
    /// Port name, also used for the environment variable and URL mapping.
    pub name: String,
    /// Container port.
    pub port: u16,
}

impl SandboxPort {
    /// Create a new port entry.
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

/// A volume mount inside the sandbox container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxVolumeMount {
    /// Name of the volume to mount.
    pub name: String,
    /// Path inside the container.
    pub mount_path: String,
    /// Informational source path.
    pub source_path: String,
    /// Mount read-only.
    pub read_only: bool,
}

/// Scratch volume backed by node storage or memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmptyDirVolume {
    /// Volume name.
    pub name: String,
    /// Storage medium, empty for node default.
    pub medium: String,
    /// Size limit in MiB, zero for unlimited.
    pub size_limit: u64,
}

/// Volume backed by a host directory.
///
/// The path may contain `{username}`, `{workspace}`, `{dataset-public}` and
/// `{course-public}` placeholders.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HostPathVolume {
    /// Volume name.
    pub name: String,
    /// Host path, possibly templated.
    pub path: String,
    /// Host path type, empty for none.
    #[serde(rename = "type")]
    pub path_type: String,
}

/// A sandbox volume. Exactly one source is expected to be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxVolume {
    /// Scratch volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub empty_dir: Option<EmptyDirVolume>,
    /// Host directory volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_path: Option<HostPathVolume>,
}

impl SandboxVolume {
    /// Host path volume.
    pub fn host_path(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            empty_dir: None,
            host_path: Some(HostPathVolume {
                name: name.into(),
                path: path.into(),
                path_type: String::new(),
            }),
        }
    }

    /// Scratch volume.
    pub fn empty_dir(name: impl Into<String>, medium: impl Into<String>, size_limit: u64) -> Self {
        Self {
            empty_dir: Some(EmptyDirVolume {
                name: name.into(),
                medium: medium.into(),
                size_limit,
            }),
            host_path: None,
        }
    }
}

/// How to run one kind of tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxTemplate {
    /// Image used when no GPU is requested.
    #[serde(rename = "cpuImageName", skip_serializing_if = "String::is_empty")]
    pub cpu_image: String,
    /// GPU driver name to image.
    #[serde(rename = "gpuImageSet", skip_serializing_if = "BTreeMap::is_empty")]
    pub gpu_images: BTreeMap<String, String>,
    /// Container command.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Container args.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Human readable title.
    #[serde(rename = "display_title", skip_serializing_if = "String::is_empty")]
    pub display_title: String,
    /// Description.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Free-form development notes.
    #[serde(rename = "developmentInfo", skip_serializing_if = "Vec::is_empty")]
    pub development_info: Vec<String>,
    /// Status string shown to users.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// Exposed ports in declaration order.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<SandboxPort>,
    /// Container volume mounts.
    #[serde(rename = "volume_mounts", skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<SandboxVolumeMount>,
    /// Pod volumes.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<SandboxVolume>,
    /// Icon shown in the UI.
    #[serde(rename = "icon_name", skip_serializing_if = "String::is_empty")]
    pub icon_name: String,
}

impl SandboxTemplate {
    /// Create a template with a CPU image and ports.
    pub fn new(cpu_image: impl Into<String>, ports: Vec<SandboxPort>) -> Self {
        Self {
            cpu_image: cpu_image.into(),
            ports,
            ..Default::default()
        }
    }

    /// Add a GPU image for a driver.
    #[must_use]
    pub fn with_gpu_image(mut self, driver: impl Into<String>, image: impl Into<String>) -> Self {
        self.gpu_images.insert(driver.into(), image.into());
        self
    }

    /// Add a volume and its mount.
    #[must_use]
    pub fn with_volume(mut self, volume: SandboxVolume, mount: SandboxVolumeMount) -> Self {
        self.volumes.push(volume);
        self.volume_mounts.push(mount);
        self
    }

    /// Set the container command.
    #[must_use]
    pub fn with_command(mut self, command: Vec<String>) -> Self {
        self.command = command;
        self
    }

    /// Image for a GPU driver.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the driver has no entry or the
    /// entry is empty.
    pub fn gpu_image(&self, sandbox: &str, driver: &str) -> Result<&str> {
        match self.gpu_images.get(driver) {
            None => Err(Error::InvalidRequest(format!(
                "gpu image {driver} not found in sandbox {sandbox}"
            ))),
            Some(image) if image.is_empty() => Err(Error::InvalidRequest(format!(
                "gpu image {driver} is empty in sandbox {sandbox}"
            ))),
            Some(image) => Ok(image),
        }
    }
}

/// All sandbox templates known to the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PluginCatalog {
    /// Sandbox offered when the user does not choose one.
    #[serde(rename = "defaultSandbox", default)]
    pub default_sandbox: String,
    /// Templates by name.
    #[serde(default)]
    pub sandboxes: BTreeMap<String, SandboxTemplate>,
}

impl PluginCatalog {
    /// Parse a catalog document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CatalogParse`] if the document is not valid.
    pub fn resolve(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Render the catalog as a JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CatalogParse`] if serialization fails.
    pub fn to_document(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Add a template.
    #[must_use]
    pub fn with_sandbox(mut self, name: impl Into<String>, template: SandboxTemplate) -> Self {
        self.sandboxes.insert(name.into(), template);
        self
    }

    /// Look up a template by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if the sandbox is not in the catalog.
    pub fn sandbox(&self, name: &str) -> Result<&SandboxTemplate> {
        self.sandboxes.get(name).ok_or_else(|| {
            Error::InvalidRequest(format!(
                "sandbox {name} not found, please ensure sandbox is proper config"
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOCUMENT: &str = r#"{
        "defaultSandbox": "jupyter-lab",
        "sandboxes": {
            "jupyter-lab": {
                "cpuImageName": "hydra/jupyter:cpu",
                "gpuImageSet": {"nvidia.com/gpu": "hydra/jupyter:cuda", "amd.com/gpu": ""},
                "command": ["start.sh"],
                "ports": [{"name": "jupyter-lab", "port": 8888}],
                "volume_mounts": [{
                    "name": "home",
                    "mount_path": "/root/notebook",
                    "source_path": "",
                    "read_only": false
                }],
                "volumes": [{
                    "host_path": {"name": "home", "path": "{workspace}/{username}", "type": ""}
                }],
                "icon_name": "lab.png",
                "developmentInfo": ["python 3.11"]
            },
            "vscode": {"cpuImageName": "hydra/vscode"}
        }
    }"#;

    #[test]
    fn test_resolve_document() {
        let catalog = PluginCatalog::resolve(DOCUMENT).unwrap();
        assert_eq!(catalog.default_sandbox, "jupyter-lab");
        assert_eq!(catalog.sandboxes.len(), 2);

        let lab = catalog.sandbox("jupyter-lab").unwrap();
        assert_eq!(lab.cpu_image, "hydra/jupyter:cpu");
        assert_eq!(lab.ports, vec![SandboxPort::new("jupyter-lab", 8888)]);
        assert_eq!(lab.command, vec!["start.sh".to_string()]);
        assert_eq!(lab.volume_mounts[0].mount_path, "/root/notebook");
        let host = lab.volumes[0].host_path.as_ref().unwrap();
        assert_eq!(host.path, "{workspace}/{username}");
        assert_eq!(lab.development_info, vec!["python 3.11".to_string()]);
    }

    #[test]
    fn test_optional_fields_default_empty() {
        let catalog = PluginCatalog::resolve(DOCUMENT).unwrap();
        let vscode = catalog.sandbox("vscode").unwrap();
        assert!(vscode.ports.is_empty());
        assert!(vscode.gpu_images.is_empty());
        assert!(vscode.volumes.is_empty());
    }

    #[test]
    fn test_unknown_sandbox() {
        let catalog = PluginCatalog::resolve(DOCUMENT).unwrap();
        let err = catalog.sandbox("rstudio").unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
    }

    #[test]
    fn test_gpu_image_lookup() {
        let catalog = PluginCatalog::resolve(DOCUMENT).unwrap();
        let lab = catalog.sandbox("jupyter-lab").unwrap();
        assert_eq!(lab.gpu_image("jupyter-lab", "nvidia.com/gpu").unwrap(), "hydra/jupyter:cuda");
        let empty = lab.gpu_image("jupyter-lab", "amd.com/gpu").unwrap_err();
        assert!(empty.to_string().contains("is empty"));
        let unknown = lab.gpu_image("jupyter-lab", "intel.com/gpu").unwrap_err();
        assert!(unknown.to_string().contains("not found"));
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(PluginCatalog::resolve("{"), Err(Error::CatalogParse(_))));
        assert!(matches!(
            PluginCatalog::resolve(r#"{"sandboxes": {"x": {"ports": [8888]}}}"#),
            Err(Error::CatalogParse(_))
        ));
    }

    #[test]
    fn test_document_roundtrip_through_builder() {
        let catalog = PluginCatalog::default().with_sandbox(
            "lab",
            SandboxTemplate::new("img", vec![SandboxPort::new("lab", 8888)])
                .with_gpu_image("nvidia.com/gpu", "img-gpu"),
        );
        let parsed = PluginCatalog::resolve(&catalog.to_document().unwrap()).unwrap();
        assert_eq!(parsed, catalog);
    }
}
