//! Host volume preparation.
//!
//! Sandbox host paths are templates. Private paths (`{username}`,
//! `{workspace}`) are rendered and created on the host before the workload
//! exists so the container never mounts a missing directory. Shared paths
//! (`{dataset-public}`, `{course-public}`) are rendered only; they are
//! expected to exist already.

use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::catalog::{SandboxVolume, SandboxVolumeMount};
use crate::config::HydraConfig;
use crate::error::Result;

/// File copied into each freshly prepared private directory when present.
pub const WORKSPACE_README: &str = "README.md";

const USERNAME_PLACEHOLDER: &str = "{username}";
const WORKSPACE_PLACEHOLDER: &str = "{workspace}";
const DATASET_PUBLIC_PLACEHOLDER: &str = "{dataset-public}";
const COURSE_PUBLIC_PLACEHOLDER: &str = "{course-public}";

/// Volume name of the per-project dataset mount.
pub const PROJECT_DATASET_VOLUME: &str = "project-dataset";

/// Volume name of the per-project course mount.
pub const PROJECT_COURSE_VOLUME: &str = "project-course";

/// Whether a host path refers to a private per-user directory.
#[must_use]
pub fn is_private_path(path: &str) -> bool {
    path.contains(USERNAME_PLACEHOLDER) || path.contains(WORKSPACE_PLACEHOLDER)
}

/// Render every placeholder of a host path.
#[must_use]
pub fn render_path(path: &str, username: &str, config: &HydraConfig) -> String {
    if is_private_path(path) {
        return path
            .replace(USERNAME_PLACEHOLDER, username)
            .replace(WORKSPACE_PLACEHOLDER, &config.workspace_path.to_string_lossy());
    }
    path.replace(DATASET_PUBLIC_PLACEHOLDER, &config.public_dataset_base_path)
        .replace(COURSE_PUBLIC_PLACEHOLDER, &config.public_course_base_path)
}

/// Render host paths in place and create the private directories.
///
/// Creation is idempotent. A failed README copy is logged only.
///
/// # Errors
///
/// Returns an error if a private directory cannot be created.
pub async fn prepare_host_paths(
    volumes: &mut [SandboxVolume],
    username: &str,
    config: &HydraConfig,
) -> Result<()> {
    for volume in volumes.iter_mut() {
        let Some(host) = volume.host_path.as_mut() else {
            continue;
        };

        let private = is_private_path(&host.path);
        host.path = render_path(&host.path, username, config);
        if !private {
            continue;
        }

        let dir = PathBuf::from(&host.path);
        tokio::fs::create_dir_all(&dir).await?;
        debug!(path = %dir.display(), "Prepared private directory");

        copy_readme(&config.workspace_path, &dir).await;
    }
    Ok(())
}

async fn copy_readme(workspace: &Path, dir: &Path) {
    let source = workspace.join(WORKSPACE_README);
    let target = dir.join(WORKSPACE_README);
    if source == target {
        return;
    }
    if let Err(e) = tokio::fs::copy(&source, &target).await {
        error!(error = %e, source = %source.display(), "Failed to copy readme");
    }
}

/// Per-project dataset and course mounts for `project_id`.
///
/// A mount is added only if its host directory exists now; a missing
/// directory is logged as a warning.
pub async fn project_mounts(
    project_id: &str,
    config: &HydraConfig,
) -> Vec<(SandboxVolume, SandboxVolumeMount)> {
    let candidates = [
        (
            PROJECT_DATASET_VOLUME,
            config.project_dataset_base_path.join(project_id),
            &config.project_dataset_mount_path,
        ),
        (
            PROJECT_COURSE_VOLUME,
            config.project_course_base_path.join(project_id),
            &config.project_course_mount_path,
        ),
    ];

    let mut mounts = Vec::new();
    for (name, host_path, mount_path) in candidates {
        if tokio::fs::metadata(&host_path).await.is_err() {
            warn!(
                path = %host_path.display(),
                volume = name,
                "Project directory not found, skipping mount"
            );
            continue;
        }
        mounts.push((
            SandboxVolume::host_path(name, host_path.to_string_lossy()),
            SandboxVolumeMount {
                name: name.to_string(),
                mount_path: mount_path.clone(),
                source_path: String::new(),
                read_only: true,
            },
        ));
    }
    mounts
}
