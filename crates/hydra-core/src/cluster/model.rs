//! Typed cluster objects.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Metadata shared by every cluster object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Namespace, empty for cluster scoped objects.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Unique id assigned by the platform.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Creation time assigned by the platform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set once deletion has been requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    /// Metadata with a name and namespace.
    pub fn named(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Add a label.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Label value by key.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// Equality-based label selector (`k1=v1,k2=v2`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    terms: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selector that matches everything.
    #[must_use]
    pub fn everything() -> Self {
        Self::default()
    }

    /// Selector with one `key=value` term.
    pub fn eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::everything().and(key, value)
    }

    /// Add a `key=value` term.
    #[must_use]
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.terms.insert(key.into(), value.into());
        self
    }

    /// Whether the labels satisfy every term.
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.terms
            .iter()
            .all(|(k, v)| labels.get(k).is_some_and(|actual| actual == v))
    }

    /// Whether the selector has no terms.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.terms {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

/// When the node pulls the container image.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PullPolicy {
    /// Pull only when the image is missing.
    #[default]
    IfNotPresent,
    /// Always pull.
    Always,
    /// Never pull.
    Never,
}

/// Environment variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Variable value.
    pub value: String,
}

impl EnvVar {
    /// Create a variable.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Named container port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    /// Port name.
    pub name: String,
    /// Port number.
    pub container_port: u16,
}

/// Volume mounted into a container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    /// Volume name.
    pub name: String,
    /// Path in the container.
    pub mount_path: String,
    /// Mount read-only.
    #[serde(default)]
    pub read_only: bool,
}

/// Resource requests and limits keyed by resource name.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequirements {
    /// Requested quantities.
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
    /// Limit quantities.
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
}

/// Container specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    /// Container name.
    pub name: String,
    /// Image reference.
    pub image: String,
    /// Pull policy.
    #[serde(default)]
    pub image_pull_policy: PullPolicy,
    /// Entrypoint override.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Arguments.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    /// Environment.
    #[serde(default)]
    pub env: Vec<EnvVar>,
    /// Exposed ports.
    #[serde(default)]
    pub ports: Vec<ContainerPort>,
    /// Volume mounts.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,
    /// Resources.
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Container {
    /// Value of an environment variable.
    #[must_use]
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

/// Where a pod volume comes from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    /// Scratch space.
    EmptyDir {
        /// Storage medium, empty for node default.
        medium: String,
        /// Size limit quantity.
        size_limit: Option<String>,
    },
    /// Host directory.
    HostPath {
        /// Host path.
        path: String,
        /// Host path type.
        path_type: Option<String>,
    },
}

/// Pod volume.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Volume {
    /// Volume name.
    pub name: String,
    /// Volume source.
    pub source: VolumeSource,
}

/// Pod specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodSpec {
    /// Containers, the first one is the primary.
    pub containers: Vec<Container>,
    /// Volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,
    /// Scheduling affinity, passed through to the platform untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<serde_json::Value>,
}

impl PodSpec {
    /// The primary container.
    #[must_use]
    pub fn primary_container(&self) -> Option<&Container> {
        self.containers.first()
    }
}

/// Pod template of a workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PodTemplate {
    /// Labels stamped on every pod.
    pub labels: BTreeMap<String, String>,
    /// Pod specification.
    pub spec: PodSpec,
}

/// Desired state of a workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSpec {
    /// Number of pods.
    pub replicas: u32,
    /// Labels selecting the pods owned by this workload.
    pub selector: BTreeMap<String, String>,
    /// Template for the pods.
    pub template: PodTemplate,
}

/// A deployment-like object running a set of identical pods.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Workload {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Specification.
    pub spec: WorkloadSpec,
}

/// Lifecycle phase of a pod.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum PodPhase {
    /// Accepted but not running yet.
    #[default]
    Pending,
    /// Running.
    Running,
    /// Exited successfully.
    Succeeded,
    /// Exited with failure.
    Failed,
    /// State cannot be obtained.
    Unknown,
}

impl fmt::Display for PodPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "Pending",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Unknown => "Unknown",
        };
        write!(f, "{s}")
    }
}

/// Observed pod state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    /// Phase.
    pub phase: PodPhase,
    /// Pod IP once scheduled.
    #[serde(default)]
    pub pod_ip: Option<String>,
}

/// A running container set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Pod {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Specification.
    pub spec: PodSpec,
    /// Observed state.
    pub status: PodStatus,
}

/// Port of an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointPort {
    /// Port name.
    pub name: String,
    /// Service port.
    pub port: u16,
    /// Pod port traffic is forwarded to.
    pub target_port: u16,
    /// Node port assigned by the platform.
    #[serde(default)]
    pub node_port: Option<u16>,
}

/// How an endpoint is exposed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum Exposure {
    /// Reachable on every node at a platform-assigned port.
    #[default]
    NodePort,
    /// Reachable inside the cluster only.
    ClusterIp,
}

/// Desired state of an endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EndpointSpec {
    /// Exposure type.
    pub exposure: Exposure,
    /// Pod selector.
    pub selector: BTreeMap<String, String>,
    /// Ports.
    pub ports: Vec<EndpointPort>,
}

/// A service-like network surface for a workload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Specification.
    pub spec: EndpointSpec,
}

/// Named string map stored in the cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConfigObject {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Data entries.
    pub data: BTreeMap<String, String>,
}

/// A cluster node.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Node {
    /// Metadata.
    pub metadata: ObjectMeta,
    /// Allocatable quantities keyed by resource name.
    pub allocatable: BTreeMap<String, String>,
}

impl Node {
    /// Node with allocatable resources.
    pub fn new<I, K, V>(name: impl Into<String>, allocatable: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            metadata: ObjectMeta::named(name, ""),
            allocatable: allocatable
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}
