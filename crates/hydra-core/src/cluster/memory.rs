//! In-process cluster platform.
//!
//! Keeps every object in memory and emits watch events for each change.
//! Creating a workload materialises one replica set and its pods in the
//! `Pending` phase; tests move them along with
//! [`InMemoryPlatform::set_pod_phase`].

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::model::{
    ConfigObject, Endpoint, LabelSelector, Node, ObjectMeta, Pod, PodPhase, PodStatus, Workload,
};
use super::platform::{ClusterObject, ClusterPlatform, ObjectKind, PlatformFuture, WatchEvent};
use crate::error::{Error, Result};

/// First node port handed out.
pub const NODE_PORT_BASE: u16 = 30000;

const WATCH_CAPACITY: usize = 1024;

/// Platform operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlatformOp {
    /// `create_workload`.
    CreateWorkload,
    /// `delete_workloads`.
    DeleteWorkloads,
    /// `delete_replica_sets`.
    DeleteReplicaSets,
    /// `delete_pods`.
    DeletePods,
    /// `create_endpoint`.
    CreateEndpoint,
    /// `delete_endpoints`.
    DeleteEndpoints,
    /// `list_nodes`.
    ListNodes,
    /// Every list call except nodes.
    List,
}

type Key = (String, String);

/// Revision of a workload's pod template, owning that revision's pods.
#[derive(Debug, Clone)]
struct ReplicaSet {
    metadata: ObjectMeta,
    owner: String,
    selector: BTreeMap<String, String>,
}

impl ReplicaSet {
    fn owns(&self, pod: &Pod) -> bool {
        pod.metadata.namespace == self.metadata.namespace
            && !self.selector.is_empty()
            && self
                .selector
                .iter()
                .all(|(k, v)| pod.metadata.labels.get(k) == Some(v))
    }
}

#[derive(Debug, Default)]
struct Objects {
    workloads: BTreeMap<Key, Workload>,
    replica_sets: BTreeMap<Key, ReplicaSet>,
    pods: BTreeMap<Key, Pod>,
    endpoints: BTreeMap<Key, Endpoint>,
    config_objects: BTreeMap<Key, ConfigObject>,
    nodes: BTreeMap<String, Node>,
    next_node_port: u16,
    failures: HashSet<PlatformOp>,
}

/// Cluster platform backed by in-memory maps.
#[derive(Debug)]
pub struct InMemoryPlatform {
    objects: RwLock<Objects>,
    events: broadcast::Sender<WatchEvent>,
    muted: AtomicBool,
}

impl Default for InMemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn in_scope(k: &Key, namespace: &str) -> bool {
    namespace.is_empty() || k.0 == namespace
}

impl InMemoryPlatform {
    /// Create an empty platform.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(Objects {
                next_node_port: NODE_PORT_BASE,
                ..Default::default()
            }),
            events,
            muted: AtomicBool::new(false),
        }
    }

    /// Add or replace a node.
    pub fn add_node(&self, node: Node) {
        self.objects
            .write()
            .nodes
            .insert(node.metadata.name.clone(), node);
    }

    /// Create or replace a config object.
    pub fn put_config_object(&self, namespace: &str, name: &str, data: BTreeMap<String, String>) {
        let object = ConfigObject {
            metadata: ObjectMeta::named(name, namespace),
            data,
        };
        self.objects
            .write()
            .config_objects
            .insert(key(namespace, name), object.clone());
        self.emit(WatchEvent::Applied(ClusterObject::ConfigObject(object)));
    }

    /// Insert a pod directly, bypassing workloads.
    pub fn put_pod(&self, pod: Pod) {
        let k = key(&pod.metadata.namespace, &pod.metadata.name);
        self.objects.write().pods.insert(k, pod.clone());
        self.emit(WatchEvent::Applied(ClusterObject::Pod(pod)));
    }

    /// Move matching pods to a phase, optionally assigning an IP.
    pub fn set_pod_phase(
        &self,
        namespace: &str,
        selector: &LabelSelector,
        phase: PodPhase,
        ip: Option<&str>,
    ) {
        let updated: Vec<Pod> = {
            let mut objects = self.objects.write();
            objects
                .pods
                .iter_mut()
                .filter(|(k, p)| in_scope(k, namespace) && selector.matches(&p.metadata.labels))
                .map(|(_, pod)| {
                    pod.status.phase = phase;
                    if let Some(ip) = ip {
                        pod.status.pod_ip = Some(ip.to_string());
                    }
                    pod.clone()
                })
                .collect()
        };
        for pod in updated {
            self.emit(WatchEvent::Applied(ClusterObject::Pod(pod)));
        }
    }

    /// Stamp a deletion timestamp on matching pods without removing them.
    pub fn mark_pods_terminating(&self, namespace: &str, selector: &LabelSelector) {
        let updated: Vec<Pod> = {
            let mut objects = self.objects.write();
            objects
                .pods
                .iter_mut()
                .filter(|(k, p)| in_scope(k, namespace) && selector.matches(&p.metadata.labels))
                .map(|(_, pod)| {
                    pod.metadata.deletion_timestamp = Some(Utc::now());
                    pod.clone()
                })
                .collect()
        };
        for pod in updated {
            self.emit(WatchEvent::Applied(ClusterObject::Pod(pod)));
        }
    }

    /// Make an operation fail until [`Self::clear_failures`] is called.
    pub fn fail_on(&self, op: PlatformOp) {
        self.objects.write().failures.insert(op);
    }

    /// Stop injecting failures.
    pub fn clear_failures(&self) {
        self.objects.write().failures.clear();
    }

    /// Number of stored workloads.
    #[must_use]
    pub fn workload_count(&self) -> usize {
        self.objects.read().workloads.len()
    }

    /// Number of stored endpoints.
    #[must_use]
    pub fn endpoint_count(&self) -> usize {
        self.objects.read().endpoints.len()
    }

    /// Number of stored replica sets.
    #[must_use]
    pub fn replica_set_count(&self) -> usize {
        self.objects.read().replica_sets.len()
    }

    /// Number of stored pods.
    #[must_use]
    pub fn pod_count(&self) -> usize {
        self.objects.read().pods.len()
    }

    /// Stop or resume emitting watch events, as if the watch connection dropped.
    pub fn mute_watch(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Tell watchers that the watch for `kind` started over.
    pub fn restart_watch(&self, kind: ObjectKind) {
        self.emit(WatchEvent::Restarted(kind));
    }

    fn check(&self, op: PlatformOp) -> Result<()> {
        if self.objects.read().failures.contains(&op) {
            return Err(Error::Platform(format!("injected failure for {op:?}")));
        }
        Ok(())
    }

    fn emit(&self, event: WatchEvent) {
        if self.muted.load(Ordering::Relaxed) {
            return;
        }
        // no receivers is fine
        let _ = self.events.send(event);
    }

    fn create_workload_sync(&self, workload: &Workload) -> Result<Workload> {
        self.check(PlatformOp::CreateWorkload)?;
        let meta = &workload.metadata;
        let k = key(&meta.namespace, &meta.name);

        let (stored, pods) = {
            let mut objects = self.objects.write();
            if objects.workloads.contains_key(&k) {
                return Err(Error::Conflict(format!(
                    "workload {} already exists",
                    meta.name
                )));
            }

            let mut stored = workload.clone();
            stored.metadata.uid = Uuid::new_v4().to_string();
            stored.metadata.creation_timestamp = Some(Utc::now());

            let hash: String = Uuid::new_v4().simple().to_string().chars().take(10).collect();
            let mut rs_meta =
                ObjectMeta::named(format!("{}-{hash}", meta.name), meta.namespace.clone());
            rs_meta.labels = stored.spec.template.labels.clone();
            rs_meta.uid = Uuid::new_v4().to_string();
            let replica_set = ReplicaSet {
                metadata: rs_meta,
                owner: meta.name.clone(),
                selector: stored.spec.selector.clone(),
            };

            let mut pods = Vec::new();
            for _ in 0..stored.spec.replicas {
                let uid = Uuid::new_v4().to_string();
                let suffix: String = uid.chars().take(5).collect();
                let mut pod_meta = ObjectMeta::named(
                    format!("{}-{suffix}", replica_set.metadata.name),
                    meta.namespace.clone(),
                );
                pod_meta.labels = stored.spec.template.labels.clone();
                pod_meta.uid = uid;
                pod_meta.creation_timestamp = Some(Utc::now());
                let pod = Pod {
                    metadata: pod_meta,
                    spec: stored.spec.template.spec.clone(),
                    status: PodStatus::default(),
                };
                objects.pods.insert(
                    key(&pod.metadata.namespace, &pod.metadata.name),
                    pod.clone(),
                );
                pods.push(pod);
            }
            objects.replica_sets.insert(
                key(&replica_set.metadata.namespace, &replica_set.metadata.name),
                replica_set,
            );
            objects.workloads.insert(k, stored.clone());
            (stored, pods)
        };

        debug!(name = %stored.metadata.name, pods = pods.len(), "Workload created");
        self.emit(WatchEvent::Applied(ClusterObject::Workload(stored.clone())));
        for pod in pods {
            self.emit(WatchEvent::Applied(ClusterObject::Pod(pod)));
        }
        Ok(stored)
    }

    /// Remove replica sets chosen by `pick` along with the pods they own.
    fn remove_replica_sets(
        objects: &mut Objects,
        pick: impl Fn(&Key, &ReplicaSet) -> bool,
    ) -> (usize, Vec<Pod>) {
        let keys: Vec<Key> = objects
            .replica_sets
            .iter()
            .filter(|(k, rs)| pick(k, rs))
            .map(|(k, _)| k.clone())
            .collect();
        let removed: Vec<ReplicaSet> = keys
            .iter()
            .filter_map(|k| objects.replica_sets.remove(k))
            .collect();

        let owned: Vec<Key> = objects
            .pods
            .iter()
            .filter(|(_, pod)| removed.iter().any(|rs| rs.owns(pod)))
            .map(|(k, _)| k.clone())
            .collect();
        let pods = owned.iter().filter_map(|k| objects.pods.remove(k)).collect();
        (removed.len(), pods)
    }

    fn delete_workloads_sync(&self, namespace: &str, selector: &LabelSelector) -> Result<usize> {
        self.check(PlatformOp::DeleteWorkloads)?;
        let (workloads, pods) = {
            let mut objects = self.objects.write();
            let keys: Vec<Key> = objects
                .workloads
                .iter()
                .filter(|(k, w)| in_scope(k, namespace) && selector.matches(&w.metadata.labels))
                .map(|(k, _)| k.clone())
                .collect();
            let workloads: Vec<Workload> = keys
                .iter()
                .filter_map(|k| objects.workloads.remove(k))
                .collect();

            // owned replica sets and their pods go with the workload
            let (_, pods) = Self::remove_replica_sets(&mut objects, |k, rs| {
                workloads
                    .iter()
                    .any(|w| k.0 == w.metadata.namespace && rs.owner == w.metadata.name)
            });
            (workloads, pods)
        };

        let count = workloads.len();
        for workload in workloads {
            self.emit(WatchEvent::Deleted(ClusterObject::Workload(workload)));
        }
        for pod in pods {
            self.emit(WatchEvent::Deleted(ClusterObject::Pod(pod)));
        }
        Ok(count)
    }

    fn delete_replica_sets_sync(&self, namespace: &str, selector: &LabelSelector) -> Result<usize> {
        self.check(PlatformOp::DeleteReplicaSets)?;
        let (count, pods) = Self::remove_replica_sets(&mut self.objects.write(), |k, rs| {
            in_scope(k, namespace) && selector.matches(&rs.metadata.labels)
        });
        for pod in pods {
            self.emit(WatchEvent::Deleted(ClusterObject::Pod(pod)));
        }
        Ok(count)
    }

    fn delete_pods_sync(&self, namespace: &str, selector: &LabelSelector) -> Result<usize> {
        self.check(PlatformOp::DeletePods)?;
        let pods: Vec<Pod> = {
            let mut objects = self.objects.write();
            let keys: Vec<Key> = objects
                .pods
                .iter()
                .filter(|(k, p)| in_scope(k, namespace) && selector.matches(&p.metadata.labels))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| objects.pods.remove(k)).collect()
        };
        let count = pods.len();
        for pod in pods {
            self.emit(WatchEvent::Deleted(ClusterObject::Pod(pod)));
        }
        Ok(count)
    }

    fn create_endpoint_sync(&self, endpoint: &Endpoint) -> Result<Endpoint> {
        self.check(PlatformOp::CreateEndpoint)?;
        let meta = &endpoint.metadata;
        let k = key(&meta.namespace, &meta.name);

        let stored = {
            let mut objects = self.objects.write();
            if objects.endpoints.contains_key(&k) {
                return Err(Error::Conflict(format!(
                    "endpoint {} already exists",
                    meta.name
                )));
            }
            let mut stored = endpoint.clone();
            stored.metadata.uid = Uuid::new_v4().to_string();
            stored.metadata.creation_timestamp = Some(Utc::now());
            for port in &mut stored.spec.ports {
                port.node_port = Some(objects.next_node_port);
                objects.next_node_port = objects.next_node_port.wrapping_add(1);
            }
            objects.endpoints.insert(k, stored.clone());
            stored
        };

        self.emit(WatchEvent::Applied(ClusterObject::Endpoint(stored.clone())));
        Ok(stored)
    }

    fn delete_endpoints_sync(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<usize> {
        self.check(PlatformOp::DeleteEndpoints)?;
        let removed: Vec<Endpoint> = {
            let mut objects = self.objects.write();
            let keys: Vec<Key> = objects
                .endpoints
                .iter()
                .filter(|(k, e)| in_scope(k, namespace) && selector.matches(&e.metadata.labels))
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| objects.endpoints.remove(k)).collect()
        };
        let count = removed.len();
        for endpoint in removed {
            self.emit(WatchEvent::Deleted(ClusterObject::Endpoint(endpoint)));
        }
        Ok(count)
    }

    fn list_matching<T: Clone>(
        &self,
        map: impl Fn(&Objects) -> &BTreeMap<Key, T>,
        labels: impl Fn(&T) -> &BTreeMap<String, String>,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<T>> {
        self.check(PlatformOp::List)?;
        let objects = self.objects.read();
        Ok(map(&objects)
            .iter()
            .filter(|(k, v)| in_scope(k, namespace) && selector.matches(labels(v)))
            .map(|(_, v)| v.clone())
            .collect())
    }
}

impl ClusterPlatform for InMemoryPlatform {
    fn create_workload<'a>(&'a self, workload: &'a Workload) -> PlatformFuture<'a, Workload> {
        Box::pin(async move { self.create_workload_sync(workload) })
    }

    fn list_workloads<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Workload>> {
        Box::pin(async move {
            self.list_matching(|o| &o.workloads, |w| &w.metadata.labels, namespace, selector)
        })
    }

    fn delete_workloads<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(async move { self.delete_workloads_sync(namespace, selector) })
    }

    fn delete_replica_sets<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(async move { self.delete_replica_sets_sync(namespace, selector) })
    }

    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Pod>> {
        Box::pin(async move {
            self.list_matching(|o| &o.pods, |p| &p.metadata.labels, namespace, selector)
        })
    }

    fn delete_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(async move { self.delete_pods_sync(namespace, selector) })
    }

    fn create_endpoint<'a>(&'a self, endpoint: &'a Endpoint) -> PlatformFuture<'a, Endpoint> {
        Box::pin(async move { self.create_endpoint_sync(endpoint) })
    }

    fn list_endpoints<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Endpoint>> {
        Box::pin(async move {
            self.list_matching(|o| &o.endpoints, |e| &e.metadata.labels, namespace, selector)
        })
    }

    fn delete_endpoints<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize> {
        Box::pin(async move { self.delete_endpoints_sync(namespace, selector) })
    }

    fn get_config_object<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, ConfigObject> {
        Box::pin(async move {
            self.objects
                .read()
                .config_objects
                .get(&key(namespace, name))
                .cloned()
                .ok_or_else(|| Error::not_found("config object", name))
        })
    }

    fn list_config_objects<'a>(
        &'a self,
        namespace: &'a str,
    ) -> PlatformFuture<'a, Vec<ConfigObject>> {
        Box::pin(async move {
            self.list_matching(
                |o| &o.config_objects,
                |c| &c.metadata.labels,
                namespace,
                &LabelSelector::everything(),
            )
        })
    }

    fn update_config_object<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        data: BTreeMap<String, String>,
    ) -> PlatformFuture<'a, ()> {
        Box::pin(async move {
            self.put_config_object(namespace, name, data);
            Ok(())
        })
    }

    fn list_nodes(&self) -> PlatformFuture<'_, Vec<Node>> {
        Box::pin(async move {
            self.check(PlatformOp::ListNodes)?;
            Ok(self.objects.read().nodes.values().cloned().collect())
        })
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
