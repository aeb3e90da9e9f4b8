//! Kubernetes cluster platform.
//!
//! Workloads map to Deployments, endpoints to Services and config objects to
//! ConfigMaps. Selector deletes list first and delete by name, so the count
//! reported is what was actually removed. Change notifications come from one
//! [`watcher`] per watched kind, started with [`KubePlatform::start_watchers`].

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::pin::pin;

use futures::StreamExt;
use k8s_openapi::NamespaceResourceScope;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::model::{
    ConfigObject, Container, ContainerPort, Endpoint, EndpointPort, EndpointSpec, EnvVar, Exposure,
    LabelSelector, Node, ObjectMeta, Pod, PodPhase, PodSpec, PodStatus, PodTemplate, PullPolicy,
    ResourceRequirements, Volume, VolumeMount, VolumeSource, Workload, WorkloadSpec,
};
use super::platform::{ClusterObject, ClusterPlatform, ObjectKind, PlatformFuture, WatchEvent};
use crate::error::{Error, Result};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "open-hydra-server";

const WATCH_CAPACITY: usize = 1024;

/// Cluster platform backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    events: broadcast::Sender<WatchEvent>,
}

impl fmt::Debug for KubePlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubePlatform")
            .field("default_namespace", &self.client.default_namespace())
            .field("watchers", &self.events.receiver_count())
            .finish()
    }
}

impl KubePlatform {
    /// Wrap an existing client.
    #[must_use]
    pub fn new(client: Client) -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self { client, events }
    }

    /// Connect using a kubeconfig file, or the in-cluster/default config when
    /// `kubeconfig` is `None`.
    ///
    /// # Errors
    ///
    /// Returns a config error if the kubeconfig cannot be read and a platform
    /// error if the client cannot be built.
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let client = match kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::Config(format!("failed to read kubeconfig '{}': {e}", path.display()))
                })?;
                let options = KubeConfigOptions::default();
                let config = kube::Config::from_custom_kubeconfig(kubeconfig, &options)
                    .await
                    .map_err(|e| Error::Config(format!("invalid kubeconfig: {e}")))?;
                Client::try_from(config)
                    .map_err(|e| Error::Platform(format!("failed to build cluster client: {e}")))?
            }
            None => Client::try_default()
                .await
                .map_err(|e| Error::Platform(format!("failed to build cluster client: {e}")))?,
        };
        info!(default_namespace = client.default_namespace(), "Connected to cluster");
        Ok(Self::new(client))
    }

    /// Start one watcher per cached kind in `namespace`.
    ///
    /// The watchers stop when `cancel` is cancelled.
    #[must_use]
    pub fn start_watchers(
        &self,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        vec![
            self.spawn_watcher(
                self.namespaced::<appsv1::Deployment>(namespace),
                ObjectKind::Workload,
                |d: appsv1::Deployment| ClusterObject::Workload(d.into()),
                cancel.clone(),
            ),
            self.spawn_watcher(
                self.namespaced::<corev1::Pod>(namespace),
                ObjectKind::Pod,
                |p: corev1::Pod| ClusterObject::Pod(p.into()),
                cancel.clone(),
            ),
            self.spawn_watcher(
                self.namespaced::<corev1::Service>(namespace),
                ObjectKind::Endpoint,
                |s: corev1::Service| ClusterObject::Endpoint(s.into()),
                cancel.clone(),
            ),
            self.spawn_watcher(
                self.namespaced::<corev1::ConfigMap>(namespace),
                ObjectKind::ConfigObject,
                |c: corev1::ConfigMap| ClusterObject::ConfigObject(c.into()),
                cancel.clone(),
            ),
        ]
    }

    fn spawn_watcher<K>(
        &self,
        api: Api<K>,
        kind: ObjectKind,
        convert: fn(K) -> ClusterObject,
        cancel: CancellationToken,
    ) -> JoinHandle<()>
    where
        K: Resource + Clone + DeserializeOwned + fmt::Debug + Send + 'static,
    {
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut stream = pin!(watcher(api, watcher::Config::default()).default_backoff());
            loop {
                let next = tokio::select! {
                    () = cancel.cancelled() => {
                        debug!(kind = kind.as_str(), "Watcher stopped");
                        return;
                    }
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(event)) => {
                        if let Some(event) = translate(event, kind, convert) {
                            // no receivers is fine
                            let _ = events.send(event);
                        }
                    }
                    Some(Err(e)) => warn!(kind = kind.as_str(), error = %e, "Watch failed"),
                    None => {
                        warn!(kind = kind.as_str(), "Watch stream ended");
                        return;
                    }
                }
            }
        })
    }

    fn namespaced<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }
}

fn translate<K>(
    event: watcher::Event<K>,
    kind: ObjectKind,
    convert: fn(K) -> ClusterObject,
) -> Option<WatchEvent> {
    match event {
        watcher::Event::Apply(object) | watcher::Event::InitApply(object) => {
            Some(WatchEvent::Applied(convert(object)))
        }
        watcher::Event::Delete(object) => Some(WatchEvent::Deleted(convert(object))),
        watcher::Event::Init => None,
        watcher::Event::InitDone => Some(WatchEvent::Restarted(kind)),
    }
}

fn api_error(kind: &'static str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(response) if response.code == 404 => Error::not_found(kind, name),
        kube::Error::Api(response) if response.code == 409 => {
            Error::Conflict(format!("{kind} {name}: {}", response.message))
        }
        other => Error::Platform(format!("{kind} {name}: {other}")),
    }
}

/// List parameters for an equality selector.
#[must_use]
pub fn list_params(selector: &LabelSelector) -> ListParams {
    if selector.is_empty() {
        ListParams::default()
    } else {
        ListParams::default().labels(&selector.to_string())
    }
}

async fn list_as<K, T>(api: Api<K>, kind: &'static str, selector: &LabelSelector) -> Result<Vec<T>>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
    T: From<K>,
{
    let list = api
        .list(&list_params(selector))
        .await
        .map_err(|e| api_error(kind, &selector.to_string(), e))?;
    Ok(list.items.into_iter().map(T::from).collect())
}

async fn delete_matching<K>(
    api: Api<K>,
    kind: &'static str,
    selector: &LabelSelector,
) -> Result<usize>
where
    K: Resource + Clone + DeserializeOwned + fmt::Debug,
{
    let list = api
        .list(&list_params(selector))
        .await
        .map_err(|e| api_error(kind, &selector.to_string(), e))?;

    let mut removed = 0;
    for object in list.items {
        let name = object.name_any();
        match api.delete(&name, &DeleteParams::background()).await {
            Ok(_) => removed += 1,
            // already gone
            Err(kube::Error::Api(response)) if response.code == 404 => {}
            Err(e) => return Err(api_error(kind, &name, e)),
        }
    }
    debug!(kind, selector = %selector, removed, "Deleted by selector");
    Ok(removed)
}

impl ClusterPlatform for KubePlatform {
    fn create_workload<'a>(&'a self, workload: &'a Workload) -> PlatformFuture<'a, Workload> {
        Box::pin(async move {
            let object = deployment(workload)?;
            let created = self
                .namespaced::<appsv1::Deployment>(&workload.metadata.namespace)
                .create(&PostParams::default(), &object)
                .await
                .map_err(|e| api_error("workload", &workload.metadata.name, e))?;
            Ok(created.into())
        })
    }

    fn list_workloads<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Workload>> {
        Box::pin(list_as(
            self.namespaced::<appsv1::Deployment>(namespace),
            "workload",
            selector,
        ))
    }

    fn delete_workloads<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(delete_matching(
            self.namespaced::<appsv1::Deployment>(namespace),
            "workload",
            selector,
        ))
    }

    fn delete_replica_sets<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(delete_matching(
            self.namespaced::<appsv1::ReplicaSet>(namespace),
            "replica set",
            selector,
        ))
    }

    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Pod>> {
        Box::pin(list_as(self.namespaced::<corev1::Pod>(namespace), "pod", selector))
    }

    fn delete_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(delete_matching(self.namespaced::<corev1::Pod>(namespace), "pod", selector))
    }

    fn create_endpoint<'a>(&'a self, endpoint: &'a Endpoint) -> PlatformFuture<'a, Endpoint> {
        Box::pin(async move {
            let created = self
                .namespaced::<corev1::Service>(&endpoint.metadata.namespace)
                .create(&PostParams::default(), &service(endpoint))
                .await
                .map_err(|e| api_error("endpoint", &endpoint.metadata.name, e))?;
            Ok(created.into())
        })
    }

    fn list_endpoints<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Endpoint>> {
        Box::pin(list_as(
            self.namespaced::<corev1::Service>(namespace),
            "endpoint",
            selector,
        ))
    }

    fn delete_endpoints<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(delete_matching(
            self.namespaced::<corev1::Service>(namespace),
            "endpoint",
            selector,
        ))
    }

    fn get_config_object<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, ConfigObject> {
        Box::pin(async move {
            let object = self
                .namespaced::<corev1::ConfigMap>(namespace)
                .get(name)
                .await
                .map_err(|e| api_error("config object", name, e))?;
            Ok(object.into())
        })
    }

    fn list_config_objects<'a>(
        &'a self,
        namespace: &'a str,
    ) -> PlatformFuture<'a, Vec<ConfigObject>> {
        Box::pin(async move {
            list_as(
                self.namespaced::<corev1::ConfigMap>(namespace),
                "config object",
                &LabelSelector::everything(),
            )
            .await
        })
    }

    fn update_config_object<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        data: BTreeMap<String, String>,
    ) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            let object = corev1::ConfigMap {
                metadata: object_meta(&ObjectMeta::named(name, namespace)),
                data: Some(data),
                ..Default::default()
            };
            let params = PatchParams::apply(FIELD_MANAGER).force();
            self.namespaced::<corev1::ConfigMap>(namespace)
                .patch(name, &params, &Patch::Apply(&object))
                .await
                .map_err(|e| api_error("config object", name, e))?;
            Ok(())
        })
    }

    fn list_nodes(&self) -> PlatformFuture<'_, Vec<Node>> {
        Box::pin(async move {
            list_as(
                Api::<corev1::Node>::all(self.client.clone()),
                "node",
                &LabelSelector::everything(),
            )
            .await
        })
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}

// ---- conversions ----

fn object_meta(meta: &ObjectMeta) -> metav1::ObjectMeta {
    metav1::ObjectMeta {
        name: Some(meta.name.clone()),
        namespace: (!meta.namespace.is_empty()).then(|| meta.namespace.clone()),
        labels: (!meta.labels.is_empty()).then(|| meta.labels.clone()),
        ..Default::default()
    }
}

impl From<metav1::ObjectMeta> for ObjectMeta {
    fn from(meta: metav1::ObjectMeta) -> Self {
        Self {
            name: meta.name.unwrap_or_default(),
            namespace: meta.namespace.unwrap_or_default(),
            labels: meta.labels.unwrap_or_default(),
            uid: meta.uid.unwrap_or_default(),
            creation_timestamp: meta.creation_timestamp.map(|t| t.0),
            deletion_timestamp: meta.deletion_timestamp.map(|t| t.0),
        }
    }
}

const fn pull_policy_name(policy: PullPolicy) -> &'static str {
    match policy {
        PullPolicy::IfNotPresent => "IfNotPresent",
        PullPolicy::Always => "Always",
        PullPolicy::Never => "Never",
    }
}

fn pull_policy(name: &str) -> PullPolicy {
    match name {
        "Always" => PullPolicy::Always,
        "Never" => PullPolicy::Never,
        _ => PullPolicy::IfNotPresent,
    }
}

fn pod_phase(name: &str) -> PodPhase {
    match name {
        "Running" => PodPhase::Running,
        "Succeeded" => PodPhase::Succeeded,
        "Failed" => PodPhase::Failed,
        "Unknown" => PodPhase::Unknown,
        _ => PodPhase::Pending,
    }
}

fn to_quantities(values: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), Quantity(v.clone())))
        .collect()
}

fn from_quantities(values: Option<BTreeMap<String, Quantity>>) -> BTreeMap<String, String> {
    values
        .unwrap_or_default()
        .into_iter()
        .map(|(k, q)| (k, q.0))
        .collect()
}

fn container(container: &Container) -> corev1::Container {
    corev1::Container {
        name: container.name.clone(),
        image: Some(container.image.clone()),
        image_pull_policy: Some(pull_policy_name(container.image_pull_policy).to_string()),
        command: (!container.command.is_empty()).then(|| container.command.clone()),
        args: (!container.args.is_empty()).then(|| container.args.clone()),
        env: Some(
            container
                .env
                .iter()
                .map(|e| corev1::EnvVar {
                    name: e.name.clone(),
                    value: Some(e.value.clone()),
                    ..Default::default()
                })
                .collect(),
        ),
        ports: Some(
            container
                .ports
                .iter()
                .map(|p| corev1::ContainerPort {
                    name: Some(p.name.clone()),
                    container_port: i32::from(p.container_port),
                    ..Default::default()
                })
                .collect(),
        ),
        volume_mounts: Some(
            container
                .volume_mounts
                .iter()
                .map(|m| corev1::VolumeMount {
                    name: m.name.clone(),
                    mount_path: m.mount_path.clone(),
                    read_only: Some(m.read_only),
                    ..Default::default()
                })
                .collect(),
        ),
        resources: Some(corev1::ResourceRequirements {
            requests: Some(to_quantities(&container.resources.requests)),
            limits: Some(to_quantities(&container.resources.limits)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl From<corev1::Container> for Container {
    fn from(container: corev1::Container) -> Self {
        let resources = container.resources.unwrap_or_default();
        Self {
            name: container.name,
            image: container.image.unwrap_or_default(),
            image_pull_policy: container
                .image_pull_policy
                .as_deref()
                .map(pull_policy)
                .unwrap_or_default(),
            command: container.command.unwrap_or_default(),
            args: container.args.unwrap_or_default(),
            env: container
                .env
                .unwrap_or_default()
                .into_iter()
                .map(|e| EnvVar::new(e.name, e.value.unwrap_or_default()))
                .collect(),
            ports: container
                .ports
                .unwrap_or_default()
                .into_iter()
                .map(|p| ContainerPort {
                    name: p.name.unwrap_or_default(),
                    container_port: u16::try_from(p.container_port).unwrap_or_default(),
                })
                .collect(),
            volume_mounts: container
                .volume_mounts
                .unwrap_or_default()
                .into_iter()
                .map(|m| VolumeMount {
                    name: m.name,
                    mount_path: m.mount_path,
                    read_only: m.read_only.unwrap_or_default(),
                })
                .collect(),
            resources: ResourceRequirements {
                requests: from_quantities(resources.requests),
                limits: from_quantities(resources.limits),
            },
        }
    }
}

fn volume(volume: &Volume) -> corev1::Volume {
    let mut out = corev1::Volume {
        name: volume.name.clone(),
        ..Default::default()
    };
    match &volume.source {
        VolumeSource::EmptyDir { medium, size_limit } => {
            out.empty_dir = Some(corev1::EmptyDirVolumeSource {
                medium: (!medium.is_empty()).then(|| medium.clone()),
                size_limit: size_limit.clone().map(Quantity),
            });
        }
        VolumeSource::HostPath { path, path_type } => {
            out.host_path = Some(corev1::HostPathVolumeSource {
                path: path.clone(),
                type_: path_type.clone(),
            });
        }
    }
    out
}

// only the sources this service creates are kept
fn volume_from(volume: corev1::Volume) -> Option<Volume> {
    let source = match (volume.host_path, volume.empty_dir) {
        (Some(host), _) => VolumeSource::HostPath {
            path: host.path,
            path_type: host.type_,
        },
        (None, Some(dir)) => VolumeSource::EmptyDir {
            medium: dir.medium.unwrap_or_default(),
            size_limit: dir.size_limit.map(|q| q.0),
        },
        (None, None) => return None,
    };
    Some(Volume {
        name: volume.name,
        source,
    })
}

fn pod_spec(spec: &PodSpec) -> Result<corev1::PodSpec> {
    let affinity = spec
        .affinity
        .clone()
        .map(serde_json::from_value::<corev1::Affinity>)
        .transpose()
        .map_err(|e| Error::InvalidRequest(format!("invalid affinity: {e}")))?;
    Ok(corev1::PodSpec {
        containers: spec.containers.iter().map(container).collect(),
        volumes: Some(spec.volumes.iter().map(volume).collect()),
        affinity,
        ..Default::default()
    })
}

impl From<corev1::PodSpec> for PodSpec {
    fn from(spec: corev1::PodSpec) -> Self {
        Self {
            containers: spec.containers.into_iter().map(Container::from).collect(),
            volumes: spec
                .volumes
                .unwrap_or_default()
                .into_iter()
                .filter_map(volume_from)
                .collect(),
            affinity: spec.affinity.and_then(|a| serde_json::to_value(a).ok()),
        }
    }
}

/// The Deployment for a workload.
///
/// # Errors
///
/// Returns [`Error::InvalidRequest`] if the affinity is not a valid
/// Kubernetes affinity.
pub fn deployment(workload: &Workload) -> Result<appsv1::Deployment> {
    let spec = &workload.spec;
    Ok(appsv1::Deployment {
        metadata: object_meta(&workload.metadata),
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(i32::try_from(spec.replicas).unwrap_or(i32::MAX)),
            selector: metav1::LabelSelector {
                match_labels: Some(spec.selector.clone()),
                ..Default::default()
            },
            template: corev1::PodTemplateSpec {
                metadata: Some(metav1::ObjectMeta {
                    labels: Some(spec.template.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(pod_spec(&spec.template.spec)?),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

impl From<appsv1::Deployment> for Workload {
    fn from(deployment: appsv1::Deployment) -> Self {
        let spec = deployment.spec.unwrap_or_default();
        let template_labels = spec
            .template
            .metadata
            .and_then(|m| m.labels)
            .unwrap_or_default();
        Self {
            metadata: deployment.metadata.into(),
            spec: WorkloadSpec {
                replicas: spec
                    .replicas
                    .and_then(|r| u32::try_from(r).ok())
                    .unwrap_or(1),
                selector: spec.selector.match_labels.unwrap_or_default(),
                template: PodTemplate {
                    labels: template_labels,
                    spec: spec.template.spec.map(PodSpec::from).unwrap_or_default(),
                },
            },
        }
    }
}

impl From<corev1::Pod> for Pod {
    fn from(pod: corev1::Pod) -> Self {
        let status = pod.status.unwrap_or_default();
        Self {
            metadata: pod.metadata.into(),
            spec: pod.spec.map(PodSpec::from).unwrap_or_default(),
            status: PodStatus {
                phase: status.phase.as_deref().map(pod_phase).unwrap_or_default(),
                pod_ip: status.pod_ip,
            },
        }
    }
}

/// The Service for an endpoint.
#[must_use]
pub fn service(endpoint: &Endpoint) -> corev1::Service {
    let exposure = match endpoint.spec.exposure {
        Exposure::NodePort => "NodePort",
        Exposure::ClusterIp => "ClusterIP",
    };
    corev1::Service {
        metadata: object_meta(&endpoint.metadata),
        spec: Some(corev1::ServiceSpec {
            type_: Some(exposure.to_string()),
            selector: Some(endpoint.spec.selector.clone()),
            ports: Some(
                endpoint
                    .spec
                    .ports
                    .iter()
                    .map(|p| corev1::ServicePort {
                        name: Some(p.name.clone()),
                        port: i32::from(p.port),
                        target_port: Some(IntOrString::Int(i32::from(p.target_port))),
                        node_port: p.node_port.map(i32::from),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl From<corev1::Service> for Endpoint {
    fn from(service: corev1::Service) -> Self {
        let spec = service.spec.unwrap_or_default();
        let exposure = match spec.type_.as_deref() {
            Some("ClusterIP") => Exposure::ClusterIp,
            _ => Exposure::NodePort,
        };
        let ports = spec
            .ports
            .unwrap_or_default()
            .into_iter()
            .map(|p| {
                let port = u16::try_from(p.port).unwrap_or_default();
                let target_port = match p.target_port {
                    Some(IntOrString::Int(n)) => u16::try_from(n).unwrap_or(port),
                    _ => port,
                };
                EndpointPort {
                    name: p.name.unwrap_or_default(),
                    port,
                    target_port,
                    node_port: p.node_port.and_then(|n| u16::try_from(n).ok()),
                }
            })
            .collect();
        Self {
            metadata: service.metadata.into(),
            spec: EndpointSpec {
                exposure,
                selector: spec.selector.unwrap_or_default(),
                ports,
            },
        }
    }
}

impl From<corev1::ConfigMap> for ConfigObject {
    fn from(config_map: corev1::ConfigMap) -> Self {
        Self {
            metadata: config_map.metadata.into(),
            data: config_map.data.unwrap_or_default(),
        }
    }
}

impl From<corev1::Node> for Node {
    fn from(node: corev1::Node) -> Self {
        Self {
            metadata: node.metadata.into(),
            allocatable: from_quantities(node.status.and_then(|s| s.allocatable)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;

    use axum::extract::{Path as UrlPath, Query, State};
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::{Value, json};

    use super::*;

    const NS: &str = "open-hydra";

    type Reply = (StatusCode, Json<Value>);
    type Shared = State<Arc<FakeApiServer>>;

    /// Just enough of the API server to exercise create, list, get and delete.
    #[derive(Default)]
    struct FakeApiServer {
        objects: Mutex<BTreeMap<(&'static str, String), Value>>,
        next_node_port: Mutex<u16>,
    }

    fn status(code: StatusCode, reason: &str) -> Reply {
        let body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": reason,
            "reason": reason,
            "code": code.as_u16(),
        });
        (code, Json(body))
    }

    fn selected(object: &Value, selector: Option<&String>) -> bool {
        selector.is_none_or(|selector| {
            selector.split(',').all(|term| {
                let (k, v) = term.split_once('=').unwrap_or((term, ""));
                object["metadata"]["labels"][k] == v
            })
        })
    }

    impl FakeApiServer {
        fn insert(&self, collection: &'static str, object: Value) {
            let name = object["metadata"]["name"].as_str().unwrap().to_string();
            self.objects.lock().insert((collection, name), object);
        }

        fn names(&self, collection: &'static str) -> Vec<String> {
            self.objects
                .lock()
                .keys()
                .filter(|(c, _)| *c == collection)
                .map(|(_, name)| name.clone())
                .collect()
        }

        fn list(&self, collection: &'static str, selector: Option<&String>) -> Reply {
            let items: Vec<Value> = self
                .objects
                .lock()
                .iter()
                .filter(|((c, _), o)| *c == collection && selected(o, selector))
                .map(|(_, o)| o.clone())
                .collect();
            let body = json!({"apiVersion": "v1", "kind": "List", "metadata": {}, "items": items});
            (StatusCode::OK, Json(body))
        }

        fn create(&self, collection: &'static str, mut object: Value) -> Reply {
            let name = object["metadata"]["name"].as_str().unwrap_or_default().to_string();
            let mut objects = self.objects.lock();
            if objects.contains_key(&(collection, name.clone())) {
                return status(StatusCode::CONFLICT, "AlreadyExists");
            }
            object["metadata"]["uid"] = json!(format!("uid-{name}"));
            if collection == "services" {
                let mut next = self.next_node_port.lock();
                if let Some(ports) = object["spec"]["ports"].as_array_mut() {
                    for port in ports {
                        port["nodePort"] = json!(30000 + *next);
                        *next += 1;
                    }
                }
            }
            objects.insert((collection, name), object.clone());
            (StatusCode::CREATED, Json(object))
        }

        fn get(&self, collection: &'static str, name: &str) -> Reply {
            match self.objects.lock().get(&(collection, name.to_string())) {
                Some(object) => (StatusCode::OK, Json(object.clone())),
                None => status(StatusCode::NOT_FOUND, "NotFound"),
            }
        }

        fn delete(&self, collection: &'static str, name: &str) -> Reply {
            match self.objects.lock().remove(&(collection, name.to_string())) {
                Some(object) => (StatusCode::OK, Json(object)),
                None => status(StatusCode::NOT_FOUND, "NotFound"),
            }
        }
    }

    fn collection(
        router: Router<Arc<FakeApiServer>>,
        base: &str,
        collection: &'static str,
    ) -> Router<Arc<FakeApiServer>> {
        router
            .route(
                base,
                get(
                    move |State(api): Shared,
                          Query(query): Query<HashMap<String, String>>| async move {
                        api.list(collection, query.get("labelSelector"))
                    },
                )
                .post(
                    move |State(api): Shared, Json(body): Json<Value>| async move {
                        api.create(collection, body)
                    },
                ),
            )
            .route(
                &format!("{base}/{{name}}"),
                get(
                    move |State(api): Shared, UrlPath(name): UrlPath<String>| async move {
                        api.get(collection, &name)
                    },
                )
                .delete(
                    move |State(api): Shared, UrlPath(name): UrlPath<String>| async move {
                        api.delete(collection, &name)
                    },
                ),
            )
    }

    fn fake_cluster() -> (KubePlatform, Arc<FakeApiServer>) {
        let api = Arc::new(FakeApiServer::default());
        let mut router = Router::new();
        for (base, name) in [
            (format!("/apis/apps/v1/namespaces/{NS}/deployments"), "deployments"),
            (format!("/apis/apps/v1/namespaces/{NS}/replicasets"), "replicasets"),
            (format!("/api/v1/namespaces/{NS}/pods"), "pods"),
            (format!("/api/v1/namespaces/{NS}/services"), "services"),
            (format!("/api/v1/namespaces/{NS}/configmaps"), "configmaps"),
            ("/api/v1/nodes".to_string(), "nodes"),
        ] {
            router = collection(router, &base, name);
        }
        let client = Client::new(router.with_state(Arc::clone(&api)), NS);
        (KubePlatform::new(client), api)
    }

    fn replica_set(name: &str, user: &str) -> Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "metadata": {"name": name, "namespace": NS, "labels": {"openhydra-user": user}},
            "spec": {"selector": {"matchLabels": {"openhydra-user": user}}},
        })
    }

    fn workload(user: &str) -> Workload {
        let labels = BTreeMap::from([("openhydra-user".to_string(), user.to_string())]);
        Workload {
            metadata: ObjectMeta {
                labels: labels.clone(),
                ..ObjectMeta::named(format!("openhydra-deploy-{user}"), NS)
            },
            spec: WorkloadSpec {
                replicas: 1,
                selector: labels.clone(),
                template: PodTemplate {
                    labels,
                    spec: PodSpec {
                        containers: vec![Container {
                            name: "jupyter-lab".to_string(),
                            image: "jupyter:cpu".to_string(),
                            ports: vec![ContainerPort {
                                name: "lab".to_string(),
                                container_port: 8888,
                            }],
                            env: vec![EnvVar::new("JUPYTER_LAB_BASE_URL", "/")],
                            ..Default::default()
                        }],
                        volumes: vec![Volume {
                            name: "workspace".to_string(),
                            source: VolumeSource::HostPath {
                                path: "/mnt/public-workspace/alice".to_string(),
                                path_type: None,
                            },
                        }],
                        affinity: None,
                    },
                },
            },
        }
    }

    #[test]
    fn test_list_params_from_selector() {
        assert_eq!(list_params(&LabelSelector::everything()).label_selector, None);
        let selector = LabelSelector::eq("openhydra-user", "alice").and("openhydra", "workload");
        assert_eq!(
            list_params(&selector).label_selector.as_deref(),
            Some("openhydra=workload,openhydra-user=alice")
        );
    }

    #[test]
    fn test_deployment_conversion() {
        let original = workload("alice");
        let object = deployment(&original).unwrap();
        let spec = object.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.selector.match_labels.as_ref().unwrap()["openhydra-user"],
            "alice"
        );

        let back = Workload::from(object);
        assert_eq!(back, original);
    }

    #[test]
    fn test_invalid_affinity_rejected() {
        let mut w = workload("alice");
        w.spec.template.spec.affinity = Some(json!({"nodeAffinity": 5}));
        assert!(matches!(deployment(&w), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_pod_conversion() {
        let pod: corev1::Pod = serde_json::from_value(json!({
            "metadata": {"name": "p1", "namespace": NS, "labels": {"openhydra-user": "bob"}},
            "spec": {"containers": [{
                "name": "lab",
                "resources": {"requests": {"nvidia.com/gpu": "1"}},
            }]},
            "status": {"phase": "Running", "podIP": "10.42.0.9"},
        }))
        .unwrap();
        let pod = Pod::from(pod);
        assert_eq!(pod.status.phase, PodPhase::Running);
        assert_eq!(pod.status.pod_ip.as_deref(), Some("10.42.0.9"));
        assert_eq!(pod.metadata.label("openhydra-user"), Some("bob"));
        let requests = &pod.spec.containers[0].resources.requests;
        assert_eq!(requests["nvidia.com/gpu"], "1");
    }

    #[test]
    fn test_watch_events_translated() {
        let convert = |p: corev1::Pod| ClusterObject::Pod(p.into());
        let pod = corev1::Pod::default;
        let applied = translate(watcher::Event::InitApply(pod()), ObjectKind::Pod, convert);
        assert!(matches!(applied, Some(WatchEvent::Applied(ClusterObject::Pod(_)))));
        let deleted = translate(watcher::Event::Delete(pod()), ObjectKind::Pod, convert);
        assert!(matches!(deleted, Some(WatchEvent::Deleted(_))));
        assert!(translate(watcher::Event::Init, ObjectKind::Pod, convert).is_none());
        let done = translate(watcher::Event::InitDone, ObjectKind::Pod, convert);
        assert!(matches!(done, Some(WatchEvent::Restarted(ObjectKind::Pod))));
    }

    #[tokio::test]
    async fn test_create_and_list_workloads() {
        let (platform, _api) = fake_cluster();
        let created = platform.create_workload(&workload("alice")).await.unwrap();
        assert_eq!(created.metadata.uid, "uid-openhydra-deploy-alice");

        let err = platform.create_workload(&workload("alice")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        platform.create_workload(&workload("bob")).await.unwrap();
        let listed = platform
            .list_workloads(NS, &LabelSelector::eq("openhydra-user", "alice"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].spec.template.spec.containers[0].image, "jupyter:cpu");
    }

    #[tokio::test]
    async fn test_delete_replica_sets_by_selector() {
        let (platform, api) = fake_cluster();
        api.insert("replicasets", replica_set("openhydra-deploy-alice-5d8f", "alice"));
        api.insert("replicasets", replica_set("openhydra-deploy-alice-7c9b", "alice"));
        api.insert("replicasets", replica_set("openhydra-deploy-bob-6f4a", "bob"));

        let alice = LabelSelector::eq("openhydra-user", "alice");
        assert_eq!(platform.delete_replica_sets(NS, &alice).await.unwrap(), 2);
        assert_eq!(api.names("replicasets"), ["openhydra-deploy-bob-6f4a"]);
        assert_eq!(platform.delete_replica_sets(NS, &alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_workloads_by_selector() {
        let (platform, api) = fake_cluster();
        platform.create_workload(&workload("alice")).await.unwrap();
        platform.create_workload(&workload("bob")).await.unwrap();

        let removed = platform
            .delete_workloads(NS, &LabelSelector::eq("openhydra-user", "bob"))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(api.names("deployments"), ["openhydra-deploy-alice"]);
    }

    #[tokio::test]
    async fn test_endpoint_gets_node_ports() {
        let (platform, _api) = fake_cluster();
        let endpoint = Endpoint {
            metadata: ObjectMeta::named("openhydra-service-alice", NS)
                .with_label("openhydra-user", "alice"),
            spec: EndpointSpec {
                exposure: Exposure::NodePort,
                selector: BTreeMap::from([("openhydra-user".to_string(), "alice".to_string())]),
                ports: vec![EndpointPort {
                    name: "jupyter-lab".to_string(),
                    port: 8888,
                    target_port: 8888,
                    node_port: None,
                }],
            },
        };
        let created = platform.create_endpoint(&endpoint).await.unwrap();
        assert_eq!(created.spec.ports[0].node_port, Some(30000));
        assert_eq!(created.spec.exposure, Exposure::NodePort);

        let listed = platform
            .list_endpoints(NS, &LabelSelector::eq("openhydra-user", "alice"))
            .await
            .unwrap();
        assert_eq!(listed[0].spec.ports[0].node_port, Some(30000));
    }

    #[tokio::test]
    async fn test_config_object_lookup() {
        let (platform, api) = fake_cluster();
        let missing = platform.get_config_object(NS, "openhydra-plugin").await;
        assert!(missing.unwrap_err().is_not_found());

        api.insert(
            "configmaps",
            json!({
                "apiVersion": "v1",
                "kind": "ConfigMap",
                "metadata": {"name": "openhydra-plugin", "namespace": NS},
                "data": {"plugins": "{}"},
            }),
        );
        let found = platform.get_config_object(NS, "openhydra-plugin").await.unwrap();
        assert_eq!(found.data["plugins"], "{}");
        assert_eq!(platform.list_config_objects(NS).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nodes_report_allocatable() {
        let (platform, api) = fake_cluster();
        api.insert(
            "nodes",
            json!({
                "apiVersion": "v1",
                "kind": "Node",
                "metadata": {"name": "gpu-node-1"},
                "status": {"allocatable": {"nvidia.com/gpu": "4", "cpu": "32"}},
            }),
        );
        let nodes = platform.list_nodes().await.unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].allocatable["nvidia.com/gpu"], "4");
    }
}
