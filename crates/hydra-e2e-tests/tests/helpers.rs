//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hydra_core::access::{AUTH_HEADER, Credentials};
use hydra_core::catalog::{SandboxPort, SandboxVolume, SandboxVolumeMount};
use hydra_core::cluster::{ClusterPlatform, LabelSelector, PodPhase};
use hydra_core::identity::{ROLE_PRIVILEGED, ROLE_STANDARD};
use hydra_core::labels::USER_LABEL;
use hydra_core::{
    ClusterStateCache, HydraConfig, InMemoryIdentity, InMemoryPlatform, PluginCatalog,
    SandboxTemplate, User,
};
use hydra_server::{AppState, HydraServer, ServerConfig};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Default test timeout.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// API group used by every test server.
pub const GROUP: &str = "open-hydra-server.openhydra.io";

/// Find an available port for testing.
pub async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Catalog with one sandbox that has CPU and NVIDIA images and a private workspace.
pub fn test_catalog() -> PluginCatalog {
    PluginCatalog::default().with_sandbox(
        "jupyter-lab",
        SandboxTemplate::new(
            "registry.local/jupyter:cpu",
            vec![SandboxPort::new("jupyter-lab", 8888)],
        )
            .with_gpu_image("nvidia.com/gpu", "registry.local/jupyter:cuda")
            .with_volume(
                SandboxVolume::host_path("workspace", "{workspace}/{username}"),
                SandboxVolumeMount {
                    name: "workspace".to_string(),
                    mount_path: "/root/notebook".to_string(),
                    ..Default::default()
                },
            ),
    )
}

/// Test server that manages its own lifecycle.
pub struct TestHydra {
    pub addr: SocketAddr,
    pub platform: Arc<InMemoryPlatform>,
    pub workspace: TempDir,
    client: reqwest::Client,
    cancel: CancellationToken,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestHydra {
    /// Start a server with the standard users `teacher` (privileged) and
    /// `alice`/`bob` (standard).
    pub async fn start() -> Self {
        Self::start_with(|config| config).await
    }

    /// Start a server, adjusting the provisioning configuration first.
    pub async fn start_with(adjust: impl FnOnce(HydraConfig) -> HydraConfig) -> Self {
        let port = find_available_port().await;
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let workspace = TempDir::new().unwrap();

        let hydra = adjust(HydraConfig::default().with_workspace_path(workspace.path()));
        let config = ServerConfig::new(addr).with_group(GROUP).with_hydra(hydra);

        let platform = Arc::new(InMemoryPlatform::new());
        platform.put_config_object(
            &config.hydra.namespace,
            &config.hydra.plugin_config_name,
            BTreeMap::from([(
                config.hydra.plugin_config_key.clone(),
                test_catalog().to_document().unwrap(),
            )]),
        );
        platform.add_node(hydra_core::cluster::Node::new("gpu-node-1", [("nvidia.com/gpu", "4")]));

        let cancel = CancellationToken::new();
        let (cache, _) = ClusterStateCache::start(
            Arc::clone(&platform) as Arc<dyn ClusterPlatform>,
            config.hydra.namespace.clone(),
            cancel.clone(),
        );
        cache.wait_for_sync(TEST_TIMEOUT).await.unwrap();

        let identity = Arc::new(InMemoryIdentity::with_users([
            User::new("teacher", ROLE_PRIVILEGED).with_password("teacher-pw"),
            User::new("alice", ROLE_STANDARD).with_password("alice-pw"),
            User::new("bob", ROLE_STANDARD).with_password("bob-pw"),
        ]));

        let cluster = Arc::clone(&platform) as Arc<dyn ClusterPlatform>;
        let state = AppState::new(config, cluster, cache, identity);
        let server = HydraServer::new(Arc::new(state));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let shutdown = async {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = server.serve_with_shutdown(addr, shutdown).await {
                eprintln!("Server error: {e}");
            }
        });

        // Wait for server to be ready
        tokio::time::sleep(Duration::from_millis(100)).await;

        Self {
            addr,
            platform,
            workspace,
            client: reqwest::Client::new(),
            cancel,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Absolute URL of a path relative to the API prefix.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}/apis/{GROUP}/v1{path}", self.addr)
    }

    /// Request builder authenticated as `user`.
    pub fn as_user(
        &self,
        method: reqwest::Method,
        path: &str,
        user: &str,
        password: &str,
    ) -> reqwest::RequestBuilder {
        let header = Credentials {
            username: user.to_string(),
            password: password.to_string(),
        }
        .to_header();
        self.client.request(method, self.url(path)).header(AUTH_HEADER, header)
    }

    /// Request builder authenticated as the privileged `teacher`.
    pub fn as_teacher(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.as_user(method, path, "teacher", "teacher-pw")
    }

    /// Unauthenticated request builder.
    pub fn anonymous(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.client.request(method, self.url(path))
    }

    /// Create a CPU device for `user` as the teacher.
    pub async fn create_device(&self, user: &str) -> reqwest::Response {
        self.as_teacher(reqwest::Method::POST, "/devices")
            .json(&serde_json::json!({
                "metadata": {"name": user},
                "spec": {"openHydraUsername": user, "sandboxName": "jupyter-lab"}
            }))
            .send()
            .await
            .unwrap()
    }

    /// Move a user's pod to running and wait until the device reports it.
    pub async fn mark_running(&self, user: &str) {
        let selector = LabelSelector::eq(USER_LABEL, user);
        self.platform
            .set_pod_phase("open-hydra", &selector, PodPhase::Running, Some("10.42.0.7"));

        let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            let response = self
                .as_teacher(reqwest::Method::GET, &format!("/devices/{user}"))
                .send()
                .await
                .unwrap();
            if response.status().is_success() {
                let device: serde_json::Value = response.json().await.unwrap();
                let spec = &device["spec"];
                if spec["deviceStatus"] == "Running" && spec["sandboxURLs"].is_string() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("device of {user} never became running");
    }

    /// Shutdown the server.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = tokio::time::timeout(TEST_TIMEOUT, handle).await;
        }
        self.cancel.cancel();
    }
}
