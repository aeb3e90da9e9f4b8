//! Server configuration.
//!
//! Loaded from TOML. The `[hydra]` table is the provisioning configuration
//! and `[identity]` selects the user store:
//!
//! ```toml
//! bind_addr = "0.0.0.0:8080"
//! kubeconfig = "/etc/open-hydra/kubeconfig"
//!
//! [identity]
//! kind = "relational"
//! address = "mysql.svc.cluster.local"
//!
//! [hydra]
//! server_ip = "10.0.0.1"
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hydra_core::{BackendConfig, HydraConfig};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Default API group.
pub const DEFAULT_GROUP: &str = "open-hydra-server.openhydra.io";

/// Configuration for the API server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to.
    pub bind_addr: SocketAddr,
    /// API group served under `/apis/{group}/v1`.
    pub group: String,
    /// CORS allowed origins (empty means all).
    pub cors_origins: Vec<String>,
    /// Seconds to wait for the state cache before serving anyway.
    pub cache_sync_timeout_secs: u64,
    /// Kubeconfig used to reach the cluster, in-cluster config when unset.
    pub kubeconfig: Option<PathBuf>,
    /// Identity backend.
    pub identity: BackendConfig,
    /// Provisioning configuration.
    pub hydra: HydraConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            group: DEFAULT_GROUP.to_string(),
            cors_origins: Vec::new(),
            cache_sync_timeout_secs: 30,
            kubeconfig: None,
            identity: BackendConfig::default(),
            hydra: HydraConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Create a new configuration with the specified bind address.
    #[must_use]
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> ApiResult<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ApiError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or fails validation.
    pub fn from_toml(content: &str) -> ApiResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ApiError::Config(format!("invalid TOML: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> ApiResult<()> {
        if self.group.is_empty() || self.group.contains('/') {
            return Err(ApiError::Config(format!("invalid API group '{}'", self.group)));
        }
        self.hydra.validate()?;
        Ok(())
    }

    /// Cache sync timeout.
    #[must_use]
    pub const fn cache_sync_timeout(&self) -> Duration {
        Duration::from_secs(self.cache_sync_timeout_secs)
    }

    /// Set the bind address.
    #[must_use]
    pub const fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    /// Set the API group.
    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    /// Add a CORS allowed origin.
    #[must_use]
    pub fn with_cors_origin(mut self, origin: impl Into<String>) -> Self {
        self.cors_origins.push(origin.into());
        self
    }

    /// Set the identity backend.
    #[must_use]
    pub fn with_identity(mut self, identity: BackendConfig) -> Self {
        self.identity = identity;
        self
    }

    /// Set the provisioning configuration.
    #[must_use]
    pub fn with_hydra(mut self, hydra: HydraConfig) -> Self {
        self.hydra = hydra;
        self
    }

    /// Turn authentication off.
    #[must_use]
    pub fn with_disable_auth(mut self, disabled: bool) -> Self {
        self.hydra = self.hydra.with_disable_auth(disabled);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.group, DEFAULT_GROUP);
        assert_eq!(config.identity, BackendConfig::Memory);
        assert_eq!(config.cache_sync_timeout(), Duration::from_secs(30));
        assert!(config.kubeconfig.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml() {
        let config = ServerConfig::from_toml(
            r#"
            bind_addr = "127.0.0.1:9000"
            kubeconfig = "/etc/open-hydra/kubeconfig"
            cors_origins = ["http://localhost:3000"]

            [identity]
            kind = "relational"
            address = "db.local"
            port = 3307

            [hydra]
            server_ip = "10.0.0.1"
            cpu_overcommit_rate = 2
            "#,
        )
        .unwrap();

        assert_eq!(config.bind_addr.port(), 9000);
        assert_eq!(config.cors_origins.len(), 1);
        assert_eq!(config.kubeconfig, Some(PathBuf::from("/etc/open-hydra/kubeconfig")));
        assert_eq!(config.hydra.server_ip, "10.0.0.1");
        assert_eq!(config.hydra.cpu_overcommit_rate, 2);
        assert_eq!(config.hydra.namespace, "open-hydra");
        match config.identity {
            BackendConfig::Relational(db) => {
                assert_eq!(db.address, "db.local");
                assert_eq!(db.port, 3307);
                assert_eq!(db.database_name, "openhydra");
            }
            other => panic!("unexpected backend {}", other.name()),
        }
    }

    #[test]
    fn test_invalid_toml() {
        let result = ServerConfig::from_toml("bind_addr = 5");
        assert!(matches!(result, Err(ApiError::Config(_))));
    }

    #[test]
    fn test_invalid_group() {
        let config = ServerConfig::default().with_group("a/b");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "group = \"lab.example.io\"\n[hydra]\ndisable_auth = true").unwrap();

        let config = ServerConfig::from_file(file.path()).unwrap();
        assert_eq!(config.group, "lab.example.io");
        assert!(config.hydra.disable_auth);
    }

    #[test]
    fn test_missing_file() {
        let err = ServerConfig::from_file("/nonexistent/hydra.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
