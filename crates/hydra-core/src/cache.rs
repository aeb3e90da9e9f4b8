//! Read-through cluster state cache.
//!
//! One background task per object kind lists the namespace, marks the kind
//! synced and then applies watch events until cancelled. Reads block until
//! every kind has synced once (bounded by a timeout) and are local lookups
//! afterwards. A lagged watch receiver triggers a re-list.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{
    ClusterObject, ClusterPlatform, ConfigObject, Endpoint, LabelSelector, ObjectKind, ObjectMeta,
    Pod, WatchEvent, Workload,
};
use crate::error::{Error, Result};

/// Default time reads wait for the initial sync.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

const RELIST_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
struct Store {
    workloads: BTreeMap<String, Workload>,
    pods: BTreeMap<String, Pod>,
    endpoints: BTreeMap<String, Endpoint>,
    config_objects: BTreeMap<String, ConfigObject>,
}

impl Store {
    fn replace(&mut self, kind: ObjectKind, objects: Vec<ClusterObject>) {
        match kind {
            ObjectKind::Workload => self.workloads.clear(),
            ObjectKind::Pod => self.pods.clear(),
            ObjectKind::Endpoint => self.endpoints.clear(),
            ObjectKind::ConfigObject => self.config_objects.clear(),
        }
        for object in objects {
            self.apply(object);
        }
    }

    fn apply(&mut self, object: ClusterObject) {
        match object {
            ClusterObject::Workload(w) => {
                self.workloads.insert(w.metadata.name.clone(), w);
            }
            ClusterObject::Pod(p) => {
                self.pods.insert(p.metadata.name.clone(), p);
            }
            ClusterObject::Endpoint(e) => {
                self.endpoints.insert(e.metadata.name.clone(), e);
            }
            ClusterObject::ConfigObject(c) => {
                self.config_objects.insert(c.metadata.name.clone(), c);
            }
        }
    }

    fn remove(&mut self, object: &ClusterObject) {
        match object {
            ClusterObject::Workload(w) => {
                self.workloads.remove(&w.metadata.name);
            }
            ClusterObject::Pod(p) => {
                self.pods.remove(&p.metadata.name);
            }
            ClusterObject::Endpoint(e) => {
                self.endpoints.remove(&e.metadata.name);
            }
            ClusterObject::ConfigObject(c) => {
                self.config_objects.remove(&c.metadata.name);
            }
        }
    }
}

const fn metadata(object: &ClusterObject) -> &ObjectMeta {
    match object {
        ClusterObject::Workload(w) => &w.metadata,
        ClusterObject::Pod(p) => &p.metadata,
        ClusterObject::Endpoint(e) => &e.metadata,
        ClusterObject::ConfigObject(c) => &c.metadata,
    }
}

#[derive(Debug)]
struct Shared {
    namespace: String,
    store: RwLock<Store>,
    synced: watch::Sender<Vec<ObjectKind>>,
}

impl Shared {
    fn mark_synced(&self, kind: ObjectKind) {
        self.synced.send_if_modified(|kinds| {
            if kinds.contains(&kind) {
                false
            } else {
                kinds.push(kind);
                true
            }
        });
    }
}

/// Cached view of the namespace's workloads, pods, endpoints and config objects.
#[derive(Debug, Clone)]
pub struct ClusterStateCache {
    shared: Arc<Shared>,
    sync_timeout: Duration,
}

impl ClusterStateCache {
    /// Start the per-kind sync tasks.
    ///
    /// The tasks stop when `cancel` is cancelled.
    #[must_use]
    pub fn start(
        platform: Arc<dyn ClusterPlatform>,
        namespace: impl Into<String>,
        cancel: CancellationToken,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let (synced, _) = watch::channel(Vec::new());
        let shared = Arc::new(Shared {
            namespace: namespace.into(),
            store: RwLock::new(Store::default()),
            synced,
        });

        let handles = ObjectKind::ALL
            .into_iter()
            .map(|kind| {
                let shared = Arc::clone(&shared);
                let platform = Arc::clone(&platform);
                let cancel = cancel.clone();
                tokio::spawn(async move { run_kind(kind, platform, shared, cancel).await })
            })
            .collect();

        let cache = Self {
            shared,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
        };
        (cache, handles)
    }

    /// Set how long reads wait for the initial sync.
    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Namespace this cache observes.
    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    /// Whether every kind has completed its initial list.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        self.shared.synced.borrow().len() == ObjectKind::ALL.len()
    }

    /// Wait for the initial sync.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSynced`] if `timeout` elapses first.
    pub async fn wait_for_sync(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.shared.synced.subscribe();
        let wait = rx.wait_for(|kinds| kinds.len() == ObjectKind::ALL.len());
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(Error::NotSynced("sync tasks stopped".to_string())),
            Err(_) => Err(Error::NotSynced(format!(
                "initial sync did not finish within {timeout:?}"
            ))),
        }
    }

    async fn ready(&self) -> Result<()> {
        if self.is_synced() {
            return Ok(());
        }
        self.wait_for_sync(self.sync_timeout).await
    }

    /// Workloads matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSynced`] before the initial sync.
    pub async fn list_workloads(&self, selector: &LabelSelector) -> Result<Vec<Workload>> {
        self.ready().await?;
        Ok(self
            .shared
            .store
            .read()
            .workloads
            .values()
            .filter(|w| selector.matches(&w.metadata.labels))
            .cloned()
            .collect())
    }

    /// Pods matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSynced`] before the initial sync.
    pub async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<Pod>> {
        self.ready().await?;
        Ok(self
            .shared
            .store
            .read()
            .pods
            .values()
            .filter(|p| selector.matches(&p.metadata.labels))
            .cloned()
            .collect())
    }

    /// Endpoints matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSynced`] before the initial sync.
    pub async fn list_endpoints(&self, selector: &LabelSelector) -> Result<Vec<Endpoint>> {
        self.ready().await?;
        Ok(self
            .shared
            .store
            .read()
            .endpoints
            .values()
            .filter(|e| selector.matches(&e.metadata.labels))
            .cloned()
            .collect())
    }

    /// First pod matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when nothing matches.
    pub async fn get_pod(&self, selector: &LabelSelector) -> Result<Pod> {
        self.list_pods(selector)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("pod", selector.to_string()))
    }

    /// First endpoint matching `selector`.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when nothing matches.
    pub async fn get_endpoint(&self, selector: &LabelSelector) -> Result<Endpoint> {
        self.list_endpoints(selector)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("endpoint", selector.to_string()))
    }

    /// Config object by name.
    ///
    /// # Errors
    ///
    /// Returns a not-found error when absent.
    pub async fn get_config_object(&self, name: &str) -> Result<ConfigObject> {
        self.ready().await?;
        self.shared
            .store
            .read()
            .config_objects
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("config object", name))
    }
}

async fn list_kind(
    platform: &dyn ClusterPlatform,
    kind: ObjectKind,
    namespace: &str,
) -> Result<Vec<ClusterObject>> {
    let everything = LabelSelector::everything();
    let objects = match kind {
        ObjectKind::Workload => platform
            .list_workloads(namespace, &everything)
            .await?
            .into_iter()
            .map(ClusterObject::Workload)
            .collect(),
        ObjectKind::Pod => platform
            .list_pods(namespace, &everything)
            .await?
            .into_iter()
            .map(ClusterObject::Pod)
            .collect(),
        ObjectKind::Endpoint => platform
            .list_endpoints(namespace, &everything)
            .await?
            .into_iter()
            .map(ClusterObject::Endpoint)
            .collect(),
        ObjectKind::ConfigObject => platform
            .list_config_objects(namespace)
            .await?
            .into_iter()
            .map(ClusterObject::ConfigObject)
            .collect(),
    };
    Ok(objects)
}

async fn run_kind(
    kind: ObjectKind,
    platform: Arc<dyn ClusterPlatform>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        // subscribe before listing so nothing between the two is missed
        let mut events = platform.watch();

        let listed = tokio::select! {
            () = cancel.cancelled() => return,
            listed = list_kind(platform.as_ref(), kind, &shared.namespace) => listed,
        };
        match listed {
            Ok(objects) => {
                let count = objects.len();
                shared.store.write().replace(kind, objects);
                shared.mark_synced(kind);
                info!(kind = kind.as_str(), count, "Cache synced");
            }
            Err(e) => {
                warn!(kind = kind.as_str(), error = %e, "Cache list failed, retrying");
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep(RELIST_BACKOFF) => continue,
                }
            }
        }

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(kind = kind.as_str(), "Cache task stopped");
                    return;
                }
                event = events.recv() => match event {
                    Ok(WatchEvent::Restarted(restarted)) if restarted == kind => {
                        debug!(kind = kind.as_str(), "Watch restarted, re-listing");
                        break;
                    }
                    Ok(event) if event.kind() == kind => apply_event(&shared, event),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(kind = kind.as_str(), missed = n, "Cache watch lagged, re-listing");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!(kind = kind.as_str(), "Watch stream closed");
                        return;
                    }
                },
            }
        }
    }
}

fn apply_event(shared: &Shared, event: WatchEvent) {
    let mut store = shared.store.write();
    match event {
        WatchEvent::Applied(object) => {
            if metadata(&object).namespace == shared.namespace {
                store.apply(object);
            }
        }
        WatchEvent::Deleted(object) => {
            if metadata(&object).namespace == shared.namespace {
                store.remove(&object);
            }
        }
        WatchEvent::Restarted(_) => {}
    }
}
