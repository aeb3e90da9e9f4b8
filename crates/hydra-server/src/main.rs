//! open-hydra-server - sandbox device API for Open Hydra
//!
//! Runs the HTTP API against a Kubernetes cluster.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use hydra_core::cluster::ClusterPlatform;
use hydra_core::{ClusterStateCache, KubePlatform};
use hydra_server::{AppState, HydraServer, ServerConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "open-hydra-server")]
#[command(about = "Open Hydra sandbox device API server")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, env = "OPEN_HYDRA_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on, overrides the config file
    #[arg(long, env = "OPEN_HYDRA_BIND")]
    bind: Option<SocketAddr>,

    /// Skip authentication and ownership checks
    #[arg(long, env = "OPEN_HYDRA_DISABLE_AUTH")]
    disable_auth: bool,

    /// Emit logs as JSON
    #[arg(long, env = "OPEN_HYDRA_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<ServerConfig> {
    let mut config = match &cli.config {
        Some(path) => ServerConfig::from_file(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config = config.with_bind_addr(bind);
    }
    if cli.disable_auth {
        config = config.with_disable_auth(true);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let config = load_config(&cli)?;
    info!(
        bind = %config.bind_addr,
        identity = config.identity.name(),
        auth = !config.hydra.disable_auth,
        "Starting Open Hydra server"
    );

    let identity = config.identity.build()?;
    identity.init().await.context("identity backend initialization failed")?;

    let platform = KubePlatform::connect(config.kubeconfig.as_deref())
        .await
        .context("failed to connect to the cluster")?;

    let cancel = CancellationToken::new();
    let mut tasks = platform.start_watchers(&config.hydra.namespace, &cancel);
    let platform = Arc::new(platform);
    let (cache, cache_tasks) = ClusterStateCache::start(
        Arc::clone(&platform) as Arc<dyn ClusterPlatform>,
        config.hydra.namespace.clone(),
        cancel.clone(),
    );
    tasks.extend(cache_tasks);
    if let Err(e) = cache.wait_for_sync(config.cache_sync_timeout()).await {
        warn!(error = %e, "State cache not synced, serving anyway");
    }

    let bind_addr = config.bind_addr;
    let state = AppState::new(config, platform, cache, identity);
    let server = HydraServer::new(Arc::new(state));

    let result = server
        .serve_with_shutdown(bind_addr, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    result?;
    Ok(())
}
