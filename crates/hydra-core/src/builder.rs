//! Workload and endpoint construction.
//!
//! Builders are pure: they turn a resolved sandbox, an allocation and the
//! prepared volumes into typed cluster objects. Validation that must fail
//! before anything touches the cluster lives here too.

use std::collections::BTreeMap;

use crate::allocator::{GpuSet, ResourceRequestSet};
use crate::catalog::{SandboxPort, SandboxTemplate, SandboxVolume, SandboxVolumeMount};
use crate::cluster::{
    Container, ContainerPort, Endpoint, EndpointPort, EndpointSpec, EnvVar, Exposure, ObjectMeta,
    PodSpec, PodTemplate, PullPolicy, ResourceRequirements, Volume, VolumeMount, VolumeSource,
    Workload, WorkloadSpec,
};
use crate::config::HydraConfig;
use crate::error::{Error, Result};
use crate::labels;
use crate::quantity;

/// Inputs of [`build_workload`].
#[derive(Debug, Clone)]
pub struct WorkloadParams<'a> {
    /// Owning user.
    pub username: &'a str,
    /// Sandbox template name.
    pub sandbox_name: &'a str,
    /// Target namespace.
    pub namespace: &'a str,
    /// Resolved container image.
    pub image: &'a str,
    /// Sandbox template supplying command, args and ports.
    pub template: &'a SandboxTemplate,
    /// Container volume mounts.
    pub volume_mounts: &'a [SandboxVolumeMount],
    /// Pod volumes with host paths already rendered.
    pub volumes: &'a [SandboxVolume],
    /// Requests and limits.
    pub resources: &'a ResourceRequestSet,
    /// Extra labels from the request.
    pub custom_labels: &'a BTreeMap<String, String>,
    /// Scheduling affinity passed through untouched.
    pub affinity: Option<serde_json::Value>,
}

/// Reject templates that expose more ports than allowed.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] when the port count exceeds the maximum.
pub fn check_port_limit(
    template: &SandboxTemplate,
    sandbox: &str,
    config: &HydraConfig,
) -> Result<()> {
    if template.ports.len() > config.maximum_ports_per_sandbox {
        return Err(Error::InvalidRequest(format!(
            "sandbox {sandbox} exposes {} ports, maximum is {}",
            template.ports.len(),
            config.maximum_ports_per_sandbox
        )));
    }
    Ok(())
}

/// Pick the container image for a sandbox and validate the result.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if the GPU driver is empty or not
/// allowed, the driver has no image, or the resolved image or the port list
/// is empty.
pub fn select_image<'a>(
    template: &'a SandboxTemplate,
    sandbox: &str,
    gpu: &GpuSet,
    config: &HydraConfig,
) -> Result<&'a str> {
    let image = if gpu.is_gpu() {
        if gpu.driver.is_empty() {
            return Err(Error::InvalidRequest(
                "both gpu driver and DefaultGpuDriver are empty".to_string(),
            ));
        }
        if !config.is_gpu_driver_allowed(&gpu.driver) {
            return Err(Error::InvalidRequest(format!(
                "gpu driver {} is not allowed",
                gpu.driver
            )));
        }
        template.gpu_image(sandbox, &gpu.driver)?
    } else {
        template.cpu_image.as_str()
    };

    if image.is_empty() {
        return Err(Error::InvalidRequest(format!("no image found for sandbox {sandbox}")));
    }
    if template.ports.is_empty() {
        return Err(Error::InvalidRequest(format!("no ports found for sandbox {sandbox}")));
    }
    Ok(image)
}

/// Labels carried by every workload and its pods.
fn reserved_labels(username: &str, sandbox: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::USER_LABEL.to_string(), username.to_string()),
        (labels::WORKLOAD_CLASS_LABEL.to_string(), labels::WORKLOAD_CLASS_VALUE.to_string()),
        (labels::IDE_TYPE_LABEL.to_string(), labels::IDE_TYPE_UNSET.to_string()),
        (labels::SANDBOX_LABEL.to_string(), sandbox.to_string()),
    ])
}

fn merge_custom(target: &mut BTreeMap<String, String>, custom: &BTreeMap<String, String>) {
    for (key, value) in custom {
        target.entry(key.clone()).or_insert_with(|| value.clone());
    }
}

fn container_env(
    username: &str,
    ports: &[SandboxPort],
    custom: &BTreeMap<String, String>,
) -> Vec<EnvVar> {
    let mut env: Vec<EnvVar> = ports
        .iter()
        .map(|p| EnvVar::new(labels::port_env_name(&p.name), format!("{username}-{}", p.name)))
        .collect();

    env.extend(
        labels::PASSTHROUGH_ENV
            .iter()
            .filter_map(|(key, var)| {
                custom.get(*key).map(|value| EnvVar::new(*var, value.clone()))
            }),
    );

    env.push(EnvVar::new(labels::ENV_USER, username));
    env
}

fn convert_volumes(volumes: &[SandboxVolume]) -> Vec<Volume> {
    let mut out = Vec::with_capacity(volumes.len());
    for volume in volumes {
        if let Some(empty) = &volume.empty_dir {
            out.push(Volume {
                name: empty.name.clone(),
                source: VolumeSource::EmptyDir {
                    medium: empty.medium.clone(),
                    size_limit: Some(quantity::mebi(empty.size_limit)),
                },
            });
        }
        if let Some(host) = &volume.host_path {
            out.push(Volume {
                name: host.name.clone(),
                source: VolumeSource::HostPath {
                    path: host.path.clone(),
                    path_type: (!host.path_type.is_empty()).then(|| host.path_type.clone()),
                },
            });
        }
    }
    out
}

/// Build the workload running a user's sandbox.
#[must_use]
pub fn build_workload(params: &WorkloadParams<'_>) -> Workload {
    let name = labels::workload_name(params.username);

    let mut workload_labels = reserved_labels(params.username, params.sandbox_name);
    merge_custom(&mut workload_labels, params.custom_labels);
    let pod_labels = workload_labels.clone();

    let container = Container {
        name: labels::container_name(&name),
        image: params.image.to_string(),
        image_pull_policy: PullPolicy::IfNotPresent,
        command: params.template.command.clone(),
        args: params.template.args.clone(),
        env: container_env(params.username, &params.template.ports, params.custom_labels),
        ports: params
            .template
            .ports
            .iter()
            .map(|p| ContainerPort {
                name: p.name.clone(),
                container_port: p.port,
            })
            .collect(),
        volume_mounts: params
            .volume_mounts
            .iter()
            .map(|m| VolumeMount {
                name: m.name.clone(),
                mount_path: m.mount_path.clone(),
                read_only: m.read_only,
            })
            .collect(),
        resources: ResourceRequirements {
            requests: params.resources.requests(),
            limits: params.resources.limits(),
        },
    };

    Workload {
        metadata: ObjectMeta {
            labels: workload_labels,
            ..ObjectMeta::named(name, params.namespace)
        },
        spec: WorkloadSpec {
            replicas: 1,
            selector: BTreeMap::from([(
                labels::USER_LABEL.to_string(),
                params.username.to_string(),
            )]),
            template: PodTemplate {
                labels: pod_labels,
                spec: PodSpec {
                    containers: vec![container],
                    volumes: convert_volumes(params.volumes),
                    affinity: params.affinity.clone(),
                },
            },
        },
    }
}

/// Build the endpoint exposing a user's sandbox ports.
#[must_use]
pub fn build_endpoint(username: &str, namespace: &str, ports: &[SandboxPort]) -> Endpoint {
    Endpoint {
        metadata: ObjectMeta::named(labels::endpoint_name(username), namespace)
            .with_label(labels::WORKLOAD_CLASS_LABEL, labels::WORKLOAD_CLASS_VALUE)
            .with_label(labels::USER_LABEL, username),
        spec: EndpointSpec {
            exposure: Exposure::NodePort,
            selector: BTreeMap::from([(labels::USER_LABEL.to_string(), username.to_string())]),
            ports: ports
                .iter()
                .map(|p| EndpointPort {
                    name: p.name.clone(),
                    port: p.port,
                    target_port: p.port,
                    node_port: None,
                })
                .collect(),
        },
    }
}
