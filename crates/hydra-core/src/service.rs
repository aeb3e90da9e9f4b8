//! Device and user orchestration.
//!
//! [`DeviceService`] ties the catalog, allocator, object builder, state cache
//! and identity backend into the request paths of the API.

use std::collections::HashMap;
use std::fmt;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::access::Principal;
use crate::allocator::{self, build_gpu_set};
use crate::builder::{self, WorkloadParams};
use crate::cache::ClusterStateCache;
use crate::catalog::PluginCatalog;
use crate::cluster::{ClusterPlatform, LabelSelector, ObjectMeta};
use crate::compositor;
use crate::config::HydraConfig;
use crate::device::{DEVICE_TYPE_CPU, DEVICE_TYPE_GPU, Device, STATUS_CREATING};
use crate::error::{Error, Result};
use crate::identity::{Course, Dataset, IdentityBackend, ROLE_PRIVILEGED, User};
use crate::labels::USER_LABEL;
use crate::summary::{self, SumUp};
use crate::volumes;

/// Who is calling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// Authentication is disabled; no ownership checks apply.
    Unrestricted,
    /// An authenticated user.
    User(Principal),
}

impl Caller {
    /// Authenticated caller.
    pub fn user(username: impl Into<String>, role: u32) -> Self {
        Self::User(Principal {
            username: username.into(),
            role,
        })
    }

    /// Whether the caller may act on anyone's resources.
    #[must_use]
    pub const fn is_privileged(&self) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::User(principal) => principal.role == ROLE_PRIVILEGED,
        }
    }

    /// Require that the caller is privileged or is `username`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] otherwise.
    pub fn ensure_owner(&self, username: &str, action: &str) -> Result<()> {
        match self {
            Self::User(principal)
                if principal.role != ROLE_PRIVILEGED && principal.username != username =>
            {
                Err(Error::Forbidden(format!(
                    "user {} does not have the right to {action} for user {username}",
                    principal.username
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Outcome of one deletion step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeletionStep {
    /// What was deleted.
    pub target: &'static str,
    /// Removed object count, or the failure message.
    pub outcome: std::result::Result<usize, String>,
}

/// Aggregate outcome of a continue-on-error delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeletionReport {
    /// Steps in execution order.
    pub steps: Vec<DeletionStep>,
}

impl DeletionReport {
    fn record(&mut self, target: &'static str, outcome: Result<usize>) {
        if let Err(e) = &outcome {
            error!(step = target, error = %e, "Deletion step failed, continuing");
        }
        self.steps.push(DeletionStep {
            target,
            outcome: outcome.map_err(|e| e.to_string()),
        });
    }

    /// Whether every step succeeded.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.steps.iter().all(|s| s.outcome.is_ok())
    }

    /// Steps that failed.
    pub fn failures(&self) -> impl Iterator<Item = &DeletionStep> {
        self.steps.iter().filter(|s| s.outcome.is_err())
    }
}

/// Runtime settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingSpec {
    /// GPU count used when a request asks for none.
    pub default_gpu_per_device: u8,
    /// Current sandbox catalog.
    pub plugin_list: PluginCatalog,
}

/// Settings object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Setting {
    /// Metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Settings.
    #[serde(default)]
    pub spec: SettingSpec,
}

fn user_selector(username: &str) -> LabelSelector {
    LabelSelector::eq(USER_LABEL, username)
}

fn validate_name(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::InvalidRequest(format!("{what} is empty")));
    }
    Ok(())
}

/// Dataset and course names become directory names under the public paths.
fn validate_record_name(value: &str, what: &str) -> Result<()> {
    validate_name(value, what)?;
    if value.contains('/') || value == "." || value == ".." {
        return Err(Error::InvalidRequest(format!("{what} '{value}' is not a plain name")));
    }
    Ok(())
}

async fn remove_public_dir(base: &str, name: &str) -> Result<()> {
    let dir = Path::new(base).join(name);
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => {
            debug!(path = %dir.display(), "Removed public directory");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            error!(path = %dir.display(), error = %e, "Failed to remove public directory");
            Err(e.into())
        }
    }
}

/// RFC 7386 JSON merge patch.
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(serde_json::Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// The device and user request paths.
pub struct DeviceService {
    platform: Arc<dyn ClusterPlatform>,
    cache: ClusterStateCache,
    identity: Arc<dyn IdentityBackend>,
    config: Arc<HydraConfig>,
    default_gpu_per_device: AtomicU8,
    device_views: RwLock<HashMap<String, Device>>,
}

impl fmt::Debug for DeviceService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceService")
            .field("namespace", &self.config.namespace)
            .field("cache_synced", &self.cache.is_synced())
            .finish_non_exhaustive()
    }
}

impl DeviceService {
    /// Create the service.
    pub fn new(
        platform: Arc<dyn ClusterPlatform>,
        cache: ClusterStateCache,
        identity: Arc<dyn IdentityBackend>,
        config: Arc<HydraConfig>,
    ) -> Self {
        let default_gpu = config.default_gpu_per_device;
        Self {
            platform,
            cache,
            identity,
            config,
            default_gpu_per_device: AtomicU8::new(default_gpu),
            device_views: RwLock::new(HashMap::new()),
        }
    }

    /// Static configuration.
    #[must_use]
    pub fn config(&self) -> &HydraConfig {
        &self.config
    }

    /// The identity backend.
    #[must_use]
    pub fn identity(&self) -> &Arc<dyn IdentityBackend> {
        &self.identity
    }

    /// The state cache.
    #[must_use]
    pub const fn cache(&self) -> &ClusterStateCache {
        &self.cache
    }

    /// Current default GPU count per device.
    #[must_use]
    pub fn default_gpu_per_device(&self) -> u8 {
        self.default_gpu_per_device.load(Ordering::Relaxed)
    }

    fn remember(&self, device: &Device) {
        self.device_views
            .write()
            .insert(device.metadata.name.clone(), device.clone());
    }

    fn remember_all(&self, devices: &[Device]) {
        *self.device_views.write() = devices
            .iter()
            .map(|d| (d.metadata.name.clone(), d.clone()))
            .collect();
    }

    async fn load_catalog(&self) -> Result<PluginCatalog> {
        let object = self
            .cache
            .get_config_object(&self.config.plugin_config_name)
            .await
            .map_err(|e| Error::Platform(format!("failed to get plugin config: {e}")))?;
        let raw = object
            .data
            .get(&self.config.plugin_config_key)
            .map(String::as_str)
            .unwrap_or_default();
        PluginCatalog::resolve(raw)
    }

    // ---- devices ----

    /// Every user's device.
    ///
    /// # Errors
    ///
    /// Returns error if users or pods cannot be listed.
    pub async fn list_devices(&self) -> Result<Vec<Device>> {
        let users = self.identity.list_users().await?;
        let pods = self.cache.list_pods(&LabelSelector::everything()).await?;
        let endpoints = self
            .cache
            .list_endpoints(&LabelSelector::everything())
            .await
            .unwrap_or_else(|e| {
                warn!(error = %e, "Failed to list endpoints, devices will have no URLs");
                Vec::new()
            });

        let devices = compositor::combine(&pods, &endpoints, &users, &self.config);
        self.remember_all(&devices);
        Ok(devices)
    }

    /// One user's device.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] for foreign devices of a non-privileged
    /// caller and a not-found error when the user does not exist.
    pub async fn get_device(&self, caller: &Caller, username: &str) -> Result<Device> {
        validate_name(username, "username")?;
        caller.ensure_owner(username, "get device")?;

        let user = self.identity.get_user(username).await?;
        let selector = user_selector(username);
        let pods = self.cache.list_pods(&selector).await?;
        let endpoints = match self.cache.get_endpoint(&selector).await {
            Ok(endpoint) => vec![endpoint],
            Err(e) => {
                warn!(username, error = %e, "Failed to get user endpoint");
                Vec::new()
            }
        };

        let users = std::slice::from_ref(&user);
        let device = compositor::combine(&pods, &endpoints, users, &self.config)
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found("device", username))?;
        self.remember(&device);
        Ok(device)
    }

    /// The last composed view of a user's device.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if no list or get has produced one yet.
    pub fn cached_device(&self, username: &str) -> Result<Device> {
        validate_name(username, "username")?;
        self.device_views
            .read()
            .get(username)
            .cloned()
            .ok_or_else(|| Error::not_found("device", username))
    }

    /// Provision a device.
    ///
    /// # Errors
    ///
    /// Returns a request error for invalid input, [`Error::Conflict`] when
    /// the user already has a workload, and a platform error when object
    /// creation fails.
    pub async fn create_device(&self, caller: &Caller, mut request: Device) -> Result<Device> {
        let username = request.spec.open_hydra_username.clone();
        let sandbox_name = request.spec.sandbox_name.clone();
        validate_name(&username, "openHydraUsername")?;
        validate_name(&sandbox_name, "sandboxName")?;

        caller.ensure_owner(&username, "create device")?;
        if !caller.is_privileged() && request.spec.device_gpu != 0 {
            return Err(Error::Forbidden(
                "user does not have the right to create gpu device".to_string(),
            ));
        }

        info!(username = %username, sandbox = %sandbox_name, "Creating device");

        self.identity
            .get_user(&username)
            .await
            .map_err(|e| Error::InvalidRequest(format!("user not found: {e}")))?;

        let selector = user_selector(&username);
        let existing = self.platform.list_workloads(&self.config.namespace, &selector).await?;
        if !existing.is_empty() {
            return Err(Error::Conflict(format!("device for user {username} already exists")));
        }

        let gpu = build_gpu_set(
            request.spec.device_gpu,
            &request.spec.gpu_driver,
            &self.config.default_gpu_driver,
            self.default_gpu_per_device(),
            self.config.use_default_gpu_when_zero,
        );

        let catalog = self.load_catalog().await?;
        let template = catalog.sandbox(&sandbox_name)?;
        builder::check_port_limit(template, &sandbox_name, &self.config)?;

        let image = builder::select_image(template, &sandbox_name, &gpu, &self.config)?;

        // host directories only once the request is known to be valid
        let mut sandbox_volumes = template.volumes.clone();
        let mut volume_mounts = template.volume_mounts.clone();
        volumes::prepare_host_paths(&mut sandbox_volumes, &username, &self.config).await?;
        let project_id = &request.spec.open_hydra_project_id;
        if self.config.add_project_resource && !project_id.is_empty() {
            for (volume, mount) in volumes::project_mounts(project_id, &self.config).await {
                sandbox_volumes.push(volume);
                volume_mounts.push(mount);
            }
        }
        let resources = allocator::allocate(
            allocator::parse_amount(&request.spec.device_cpu, "cpu"),
            allocator::parse_amount(&request.spec.device_ram, "memory"),
            &gpu,
            &self.config,
        );

        let workload = builder::build_workload(&WorkloadParams {
            username: &username,
            sandbox_name: &sandbox_name,
            namespace: &self.config.namespace,
            image,
            template,
            volume_mounts: &volume_mounts,
            volumes: &sandbox_volumes,
            resources: &resources,
            custom_labels: &request.metadata.labels,
            affinity: request.spec.affinity.clone(),
        });
        self.platform.create_workload(&workload).await.map_err(|e| {
            error!(username = %username, error = %e, "Failed to create workload");
            Error::Platform(format!("failed to create workload: {e}"))
        })?;

        let endpoint = builder::build_endpoint(&username, &self.config.namespace, &template.ports);
        self.platform.create_endpoint(&endpoint).await.map_err(|e| {
            error!(username = %username, error = %e, "Failed to create endpoint");
            Error::Platform(format!("failed to create endpoint: {e}"))
        })?;

        let device_type = if gpu.is_gpu() { DEVICE_TYPE_GPU } else { DEVICE_TYPE_CPU };
        request.spec.device_type = device_type.to_string();
        request.spec.device_status = STATUS_CREATING.to_string();
        info!(username = %username, image, "Device created");
        Ok(request)
    }

    async fn release(&self, username: &str) -> DeletionReport {
        let namespace = self.config.namespace.as_str();
        let selector = user_selector(username);
        let mut report = DeletionReport::default();

        report.record("workload", self.platform.delete_workloads(namespace, &selector).await);
        if self.config.patch_resource_not_release {
            let replica_sets = self.platform.delete_replica_sets(namespace, &selector).await;
            report.record("replica_sets", replica_sets);
            report.record("pods", self.platform.delete_pods(namespace, &selector).await);
        }
        report.record("endpoint", self.platform.delete_endpoints(namespace, &selector).await);
        self.device_views.write().remove(username);
        report
    }

    /// Remove a device. Every step is attempted even when earlier ones fail.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] for foreign devices of a non-privileged
    /// caller.
    pub async fn delete_device(
        &self,
        caller: &Caller,
        username: &str,
    ) -> Result<(Device, DeletionReport)> {
        validate_name(username, "username")?;
        caller.ensure_owner(username, "delete device")?;

        let report = self.release(username).await;
        debug!(username, complete = report.is_complete(), "Device deletion finished");
        Ok((Device::terminating(username), report))
    }

    /// GPU accounting across the cluster.
    ///
    /// # Errors
    ///
    /// Returns error if pods or nodes cannot be listed.
    pub async fn sum_up(&self) -> Result<SumUp> {
        let pods = self.cache.list_pods(&LabelSelector::everything()).await?;
        let nodes = self.platform.list_nodes().await?;
        Ok(summary::summarize(&pods, &nodes, &self.config, self.default_gpu_per_device()))
    }

    // ---- settings ----

    /// Current settings.
    ///
    /// # Errors
    ///
    /// Returns error if the catalog cannot be loaded.
    pub async fn get_settings(&self, name: &str) -> Result<Setting> {
        Ok(Setting {
            metadata: ObjectMeta::named(name, ""),
            spec: SettingSpec {
                default_gpu_per_device: self.default_gpu_per_device(),
                plugin_list: self.load_catalog().await?,
            },
        })
    }

    /// Update the runtime default GPU count per device.
    pub fn update_settings(&self, setting: &Setting) -> Setting {
        self.default_gpu_per_device
            .store(setting.spec.default_gpu_per_device, Ordering::Relaxed);
        info!(gpu = setting.spec.default_gpu_per_device, "Default GPU per device updated");
        setting.clone()
    }

    // ---- users ----

    /// Check credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthenticated`] on any backend failure.
    pub async fn login(&self, username: &str, password: &str) -> Result<User> {
        self.identity.login_user(username, password).await.map_err(|e| {
            warn!(username, error = %e, "Login failed");
            Error::Unauthenticated(format!("login failed for {username}"))
        })
    }

    /// Every user.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    pub async fn list_users(&self) -> Result<Vec<User>> {
        self.identity.list_users().await
    }

    /// Register a user.
    ///
    /// # Errors
    ///
    /// Returns error if the name is empty, the user exists or the backend fails.
    pub async fn create_user(&self, user: &User) -> Result<User> {
        validate_name(user.name(), "user name")?;
        self.identity.create_user(user).await?;
        info!(user = %user.name(), role = user.spec.role, "User created");
        Ok(user.clone())
    }

    /// One user.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Forbidden`] for a foreign user of a non-privileged
    /// caller, or a not-found error.
    pub async fn get_user(&self, caller: &Caller, name: &str) -> Result<User> {
        validate_name(name, "user name")?;
        caller.ensure_owner(name, "get user")?;
        self.identity.get_user(name).await
    }

    /// Replace a user's attributes; unchanged input is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the user does not exist.
    pub async fn update_user(&self, name: &str, mut user: User) -> Result<User> {
        let existing = self.identity.get_user(name).await?;
        if existing.spec == user.spec {
            debug!(user = name, "User unchanged");
            return Ok(existing);
        }
        user.metadata.name = name.to_string();
        self.identity.update_user(&user).await?;
        Ok(user)
    }

    /// Apply a JSON merge patch to a user.
    ///
    /// # Errors
    ///
    /// Returns a request error if the patched document is not a valid user.
    pub async fn patch_user(&self, name: &str, patch: &Value) -> Result<User> {
        let existing = self.identity.get_user(name).await?;
        let mut document = serde_json::to_value(&existing)
            .map_err(|e| Error::InvalidRequest(format!("failed to encode user: {e}")))?;
        merge_patch(&mut document, patch);
        let patched: User = serde_json::from_value(document)
            .map_err(|e| Error::InvalidRequest(format!("invalid user patch: {e}")))?;
        self.update_user(name, patched).await
    }

    /// Remove a user and, best-effort, their device.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the user does not exist or the backend
    /// refuses the delete.
    pub async fn delete_user(&self, name: &str) -> Result<User> {
        let user = self.identity.get_user(name).await?;
        self.identity.delete_user(name).await?;

        let report = self.release(name).await;
        for failure in report.failures() {
            warn!(user = name, step = failure.target, "Leftover device object after user deletion");
        }
        info!(user = name, "User deleted");
        Ok(user)
    }
    // ---- datasets ----

    /// Every dataset.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    pub async fn list_datasets(&self) -> Result<Vec<Dataset>> {
        self.identity.list_datasets().await
    }

    /// One dataset.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the dataset does not exist.
    pub async fn get_dataset(&self, name: &str) -> Result<Dataset> {
        validate_record_name(name, "dataset name")?;
        self.identity.get_dataset(name).await
    }

    /// Register a dataset.
    ///
    /// # Errors
    ///
    /// Returns a request error for an unusable name and [`Error::Conflict`]
    /// if the dataset exists.
    pub async fn create_dataset(&self, dataset: &Dataset) -> Result<Dataset> {
        let name = dataset.metadata.name.as_str();
        validate_record_name(name, "dataset name")?;
        self.identity.create_dataset(dataset).await?;
        info!(dataset = name, "Dataset created");
        self.identity.get_dataset(name).await
    }

    /// Replace a dataset's description.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the dataset does not exist.
    pub async fn update_dataset(&self, name: &str, dataset: Dataset) -> Result<Dataset> {
        let mut existing = self.get_dataset(name).await?;
        existing.spec.description = dataset.spec.description;
        self.identity.update_dataset(&existing).await?;
        self.identity.get_dataset(name).await
    }

    /// Remove a dataset record and its public directory.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the dataset does not exist and an io
    /// error if the directory cannot be removed.
    pub async fn delete_dataset(&self, name: &str) -> Result<Dataset> {
        let dataset = self.get_dataset(name).await?;
        self.identity.delete_dataset(name).await?;
        remove_public_dir(&self.config.public_dataset_base_path, name).await?;
        info!(dataset = name, "Dataset deleted");
        Ok(dataset)
    }

    // ---- courses ----

    /// Sandbox a course runs in; empty means the catalog default.
    async fn course_sandbox(&self, requested: &str) -> Result<String> {
        let catalog = self.load_catalog().await?;
        if requested.is_empty() {
            return Ok(catalog.default_sandbox);
        }
        catalog.sandbox(requested)?;
        Ok(requested.to_string())
    }

    /// Every course.
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails.
    pub async fn list_courses(&self) -> Result<Vec<Course>> {
        self.identity.list_courses().await
    }

    /// One course.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the course does not exist.
    pub async fn get_course(&self, name: &str) -> Result<Course> {
        validate_record_name(name, "course name")?;
        self.identity.get_course(name).await
    }

    /// Register a course.
    ///
    /// # Errors
    ///
    /// Returns a request error for an unusable name or an unknown sandbox
    /// and [`Error::Conflict`] if the course exists.
    pub async fn create_course(&self, mut course: Course) -> Result<Course> {
        let name = course.metadata.name.clone();
        validate_record_name(&name, "course name")?;
        course.spec.sandbox_name = self.course_sandbox(&course.spec.sandbox_name).await?;
        self.identity.create_course(&course).await?;
        info!(course = %name, sandbox = %course.spec.sandbox_name, "Course created");
        self.identity.get_course(&name).await
    }

    /// Replace a course's description, level and sandbox.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the course does not exist and a request
    /// error for an unknown sandbox.
    pub async fn update_course(&self, name: &str, course: Course) -> Result<Course> {
        let mut existing = self.get_course(name).await?;
        if !course.spec.sandbox_name.is_empty() {
            existing.spec.sandbox_name = self.course_sandbox(&course.spec.sandbox_name).await?;
        }
        existing.spec.description = course.spec.description;
        existing.spec.level = course.spec.level;
        self.identity.update_course(&existing).await?;
        self.identity.get_course(name).await
    }

    /// Remove a course record and its public directory.
    ///
    /// # Errors
    ///
    /// Returns a not-found error if the course does not exist and an io
    /// error if the directory cannot be removed.
    pub async fn delete_course(&self, name: &str) -> Result<Course> {
        let course = self.get_course(name).await?;
        self.identity.delete_course(name).await?;
        remove_public_dir(&self.config.public_course_base_path, name).await?;
        info!(course = name, "Course deleted");
        Ok(course)
    }
}
