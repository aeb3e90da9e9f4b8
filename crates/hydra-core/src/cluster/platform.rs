//! Cluster platform contract.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::broadcast;

use super::model::{ConfigObject, Endpoint, LabelSelector, Node, Pod, Workload};
use crate::error::Result;

/// Boxed future returned by platform calls.
pub type PlatformFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Kind of a watched object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Workloads.
    Workload,
    /// Pods.
    Pod,
    /// Endpoints.
    Endpoint,
    /// Config objects.
    ConfigObject,
}

impl ObjectKind {
    /// Every watched kind.
    pub const ALL: [Self; 4] = [Self::Workload, Self::Pod, Self::Endpoint, Self::ConfigObject];

    /// Lower-case name used in logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Workload => "workload",
            Self::Pod => "pod",
            Self::Endpoint => "endpoint",
            Self::ConfigObject => "config_object",
        }
    }
}

/// A watched object.
#[derive(Debug, Clone)]
pub enum ClusterObject {
    /// Workload.
    Workload(Workload),
    /// Pod.
    Pod(Pod),
    /// Endpoint.
    Endpoint(Endpoint),
    /// Config object.
    ConfigObject(ConfigObject),
}

impl ClusterObject {
    /// Kind of the object.
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Workload(_) => ObjectKind::Workload,
            Self::Pod(_) => ObjectKind::Pod,
            Self::Endpoint(_) => ObjectKind::Endpoint,
            Self::ConfigObject(_) => ObjectKind::ConfigObject,
        }
    }
}

/// Change notification emitted by a platform.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// Object was created or modified.
    Applied(ClusterObject),
    /// Object was removed.
    Deleted(ClusterObject),
    /// The watch for a kind started over; earlier deletions may have been missed.
    Restarted(ObjectKind),
}

impl WatchEvent {
    /// Kind of the affected object.
    #[must_use]
    pub const fn kind(&self) -> ObjectKind {
        match self {
            Self::Applied(obj) | Self::Deleted(obj) => obj.kind(),
            Self::Restarted(kind) => *kind,
        }
    }
}

/// Operations this service needs from the cluster.
///
/// Every call is namespaced and, where it lists or deletes, filtered by a
/// label selector. Deletes succeed when nothing matches.
pub trait ClusterPlatform: Send + Sync {
    /// Create a workload and return it as stored.
    ///
    /// # Errors
    ///
    /// Returns error if the workload already exists or creation fails.
    fn create_workload<'a>(&'a self, workload: &'a Workload) -> PlatformFuture<'a, Workload>;

    /// List workloads.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    fn list_workloads<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Workload>>;

    /// Delete workloads, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns error if deletion fails.
    fn delete_workloads<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize>;

    /// Delete the replica sets behind workloads.
    ///
    /// # Errors
    ///
    /// Returns error if deletion fails.
    fn delete_replica_sets<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize>;

    /// List pods.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    fn list_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Pod>>;

    /// Delete pods.
    ///
    /// # Errors
    ///
    /// Returns error if deletion fails.
    fn delete_pods<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize>;

    /// Create an endpoint; node ports are assigned by the platform.
    ///
    /// # Errors
    ///
    /// Returns error if the endpoint already exists or creation fails.
    fn create_endpoint<'a>(&'a self, endpoint: &'a Endpoint) -> PlatformFuture<'a, Endpoint>;

    /// List endpoints.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    fn list_endpoints<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, Vec<Endpoint>>;

    /// Delete endpoints.
    ///
    /// # Errors
    ///
    /// Returns error if deletion fails.
    fn delete_endpoints<'a>(
        &'a self,
        namespace: &'a str,
        selector: &'a LabelSelector,
    ) -> PlatformFuture<'a, usize>;

    /// Fetch a config object by name.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if absent.
    fn get_config_object<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
    ) -> PlatformFuture<'a, ConfigObject>;

    /// List config objects.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    fn list_config_objects<'a>(
        &'a self,
        namespace: &'a str,
    ) -> PlatformFuture<'a, Vec<ConfigObject>>;

    /// Replace the data of a config object, creating it when absent.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    fn update_config_object<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        data: BTreeMap<String, String>,
    ) -> PlatformFuture<'a, ()>;

    /// List every node.
    ///
    /// # Errors
    ///
    /// Returns error if listing fails.
    fn list_nodes(&self) -> PlatformFuture<'_, Vec<Node>>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}
