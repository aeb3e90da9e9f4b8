//! Shared state for the API server.

use std::sync::Arc;

use hydra_core::cluster::ClusterPlatform;
use hydra_core::{AccessControl, ClusterStateCache, DeviceService, IdentityBackend};

use crate::config::ServerConfig;
use crate::routes::authorization_table;

/// Shared state for the API server.
#[derive(Debug)]
pub struct AppState {
    /// Server configuration.
    config: Arc<ServerConfig>,
    /// Device and user request paths.
    service: DeviceService,
    /// Request filter.
    access: AccessControl,
}

impl AppState {
    /// Create the state from a running cache and a ready identity backend.
    pub fn new(
        config: ServerConfig,
        platform: Arc<dyn ClusterPlatform>,
        cache: ClusterStateCache,
        identity: Arc<dyn IdentityBackend>,
    ) -> Self {
        let access =
            AccessControl::new(authorization_table(), Arc::clone(&identity), config.group.clone());
        let service = DeviceService::new(platform, cache, identity, Arc::new(config.hydra.clone()));
        Self {
            config: Arc::new(config),
            service,
            access,
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the device service.
    #[must_use]
    pub const fn service(&self) -> &DeviceService {
        &self.service
    }

    /// Get the request filter.
    #[must_use]
    pub const fn access(&self) -> &AccessControl {
        &self.access
    }

    /// Whether authentication and ownership checks are off.
    #[must_use]
    pub fn auth_disabled(&self) -> bool {
        self.config.hydra.disable_auth
    }
}
