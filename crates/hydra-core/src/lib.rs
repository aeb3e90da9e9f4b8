//! # hydra-core
//!
//! Sandbox device provisioning for Open Hydra.
//!
//! A device is one user's sandbox: a single-replica workload running a
//! catalog image, plus an endpoint exposing its ports on node ports. This
//! crate holds everything between the HTTP surface and the cluster:
//!
//! - **Catalog**: sandbox templates loaded from a cluster config object
//! - **Allocation**: CPU, memory and GPU requests/limits with overcommit
//! - **Builders**: workload and endpoint objects for a device
//! - **State cache**: a watch-driven local view of workloads, pods, endpoints
//!   and config objects
//! - **Identity**: pluggable user stores (memory, MySQL, Keystone)
//! - **Access control**: header credentials and a route authorization table
//! - **Service**: the create/get/list/delete device and user request paths
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use hydra_core::{
//!     ClusterStateCache, DeviceService, HydraConfig, InMemoryIdentity, InMemoryPlatform,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> hydra_core::Result<()> {
//! let config = Arc::new(HydraConfig::default());
//! let platform = Arc::new(InMemoryPlatform::new());
//! let namespace = config.namespace.clone();
//! let (cache, _tasks) =
//!     ClusterStateCache::start(platform.clone(), namespace, CancellationToken::new());
//! let service = DeviceService::new(platform, cache, Arc::new(InMemoryIdentity::new()), config);
//! let devices = service.list_devices().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod access;
pub mod allocator;
pub mod builder;
pub mod cache;
pub mod catalog;
pub mod cluster;
pub mod compositor;
pub mod config;
pub mod device;
pub mod error;
pub mod identity;
pub mod labels;
pub mod quantity;
pub mod service;
pub mod singleflight;
pub mod summary;
pub mod volumes;

pub use access::{AccessControl, AuthorizationTable, Credentials, HttpMethod, Principal, RouteKey};
pub use cache::ClusterStateCache;
pub use catalog::{PluginCatalog, SandboxTemplate};
pub use cluster::{ClusterPlatform, InMemoryPlatform, KubePlatform};
pub use config::{HydraConfig, IngressConfig};
pub use device::{Device, DeviceSpec};
pub use error::{Error, Result};
pub use identity::{
    BackendConfig, Course, Dataset, IdentityBackend, InMemoryIdentity, User, UserSpec,
};
pub use service::{Caller, DeletionReport, DeviceService, Setting, SettingSpec};
pub use summary::SumUp;
