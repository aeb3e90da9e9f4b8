//! Reserved labels, passthrough keys and derived object names.

/// Label carrying the owning username.
pub const USER_LABEL: &str = "openhydra-user";

/// Label marking objects managed by this service.
pub const WORKLOAD_CLASS_LABEL: &str = "openhydra";

/// Value of [`WORKLOAD_CLASS_LABEL`].
pub const WORKLOAD_CLASS_VALUE: &str = "openhydra-workload";

/// Label carrying the sandbox template name.
pub const SANDBOX_LABEL: &str = "openhydra-sandbox";

/// Label carrying the IDE type.
pub const IDE_TYPE_LABEL: &str = "openhydra-ide-type";

/// IDE type used when the request does not name one.
pub const IDE_TYPE_UNSET: &str = "unset";

/// Prefix of every injected environment variable.
pub const ENV_PREFIX: &str = "OPENHYDRA";

/// Environment variable carrying the username.
pub const ENV_USER: &str = "OPENHYDRA_USER";

/// Custom label keys that are forwarded into the container environment.
///
/// Each entry is `(label key, environment variable)`.
pub const PASSTHROUGH_ENV: [(&str, &str); 4] = [
    ("openhydra-jupyter-lab-token", "OPENHYDRA_JUPYTER_LAB_TOKEN"),
    ("openhydra-service-account-token", "OPENHYDRA_SERVICE_ACCOUNT"),
    ("openhydra-server-address", "OPENHYDRA_SERVER_ADDRESS"),
    ("openhydra-heartbeat-lost-interval", "OPENHYDRA_HEARTBEAT_LOST_INTERVAL"),
];

/// Name of the workload owned by `username`.
#[must_use]
pub fn workload_name(username: &str) -> String {
    format!("openhydra-deploy-{username}")
}

/// Name of the endpoint owned by `username`.
#[must_use]
pub fn endpoint_name(username: &str) -> String {
    format!("openhydra-service-{username}")
}

/// Name of the primary container of a workload.
#[must_use]
pub fn container_name(workload_name: &str) -> String {
    format!("{workload_name}-container")
}

/// Name of the device view returned for `username`.
#[must_use]
pub fn device_name(username: &str) -> String {
    format!("{username}-device")
}

/// Environment variable announcing a port, e.g. `jupyter-lab` becomes
/// `OPENHYDRA_JUPYTER_LAB`.
#[must_use]
pub fn port_env_name(port_name: &str) -> String {
    format!("{ENV_PREFIX}_{}", port_name.to_uppercase().replace('-', "_"))
}
