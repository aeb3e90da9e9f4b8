//! Cluster object model and platform contract.
//!
//! The model covers only the object shapes this service creates or reads:
//! workloads and their pods, node-port endpoints, config objects and nodes.
//! [`KubePlatform`] serves them from a Kubernetes cluster and
//! [`InMemoryPlatform`] from process memory for tests.

pub mod kubernetes;
pub mod memory;
pub mod model;
pub mod platform;

pub use kubernetes::KubePlatform;
pub use memory::{InMemoryPlatform, PlatformOp};
pub use model::{
    ConfigObject, Container, ContainerPort, Endpoint, EndpointPort, EndpointSpec, EnvVar, Exposure,
    LabelSelector, Node, ObjectMeta, Pod, PodPhase, PodSpec, PodStatus, PodTemplate, PullPolicy,
    ResourceRequirements, Volume, VolumeMount, VolumeSource, Workload, WorkloadSpec,
};
pub use platform::{ClusterObject, ClusterPlatform, ObjectKind, PlatformFuture, WatchEvent};
