//! Sandbox provisioning.
//!
//! A sandbox is the isolated container one job runs in. The orchestrator only
//! talks to sandboxes through [`SandboxProvisioner`], so the HTTP layer and the
//! reconciler can be exercised without a container runtime.

pub mod detect;
pub mod docker;

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::OrchestratorError;

pub use detect::{DockerStatus, check_docker};
pub use docker::DockerProvisioner;

/// Opaque reference to a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxHandle {
    /// Runtime identifier (container id for Docker).
    pub id: String,
    /// Human-readable name (`agent-job-<job_id>` for Docker).
    pub name: String,
}

impl fmt::Display for SandboxHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Observed state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    /// Still executing (or about to).
    Running,
    /// Terminated. The exit code is unknown when the runtime did not report one.
    Exited { exit_code: Option<i64> },
    /// The runtime no longer knows about the sandbox (it was reaped).
    NotFound,
}

/// Everything needed to launch the sandbox for one job.
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub job_id: Uuid,
    pub task: String,
    /// Host path of the job workspace.
    pub workspace: PathBuf,
    /// Host port the in-sandbox view port is published on.
    pub host_port: u16,
}

/// Launches, inspects and reclaims sandboxes.
#[async_trait]
pub trait SandboxProvisioner: Send + Sync {
    /// Create and start a sandbox. Either the sandbox is running when this
    /// returns `Ok`, or nothing was left behind.
    async fn provision(&self, request: &ProvisionRequest)
    -> Result<SandboxHandle, OrchestratorError>;

    /// Query the current state of a sandbox.
    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxState, OrchestratorError>;

    /// Remove a sandbox. Removing one that is already gone is not an error.
    async fn remove(&self, handle: &SandboxHandle) -> Result<(), OrchestratorError>;
}

/// Connect to the local Docker (or Podman) daemon and verify it answers.
///
/// Tries bollard's defaults first (which honour `DOCKER_HOST`), then the
/// well-known per-user socket locations used by Docker Desktop, OrbStack,
/// rootless Docker and rootless Podman.
pub async fn connect_docker() -> Result<bollard::Docker, bollard::errors::Error> {
    let default = bollard::Docker::connect_with_local_defaults();
    let first_err = match default {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => e,
        },
        Err(e) => e,
    };

    #[cfg(unix)]
    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let Some(path) = socket.to_str() else {
            continue;
        };
        let Ok(docker) =
            bollard::Docker::connect_with_unix(path, 120, bollard::API_DEFAULT_VERSION)
        else {
            continue;
        };
        if docker.ping().await.is_ok() {
            tracing::debug!(socket = %path, "Connected to container runtime via fallback socket");
            return Ok(docker);
        }
    }

    Err(first_err)
}

#[cfg(unix)]
fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = vec![PathBuf::from("/var/run/docker.sock")];
    if let Ok(home) = std::env::var("HOME") {
        let home = PathBuf::from(home);
        sockets.push(home.join(".docker/run/docker.sock"));
        sockets.push(home.join(".orbstack/run/docker.sock"));
    }
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        let runtime_dir = PathBuf::from(runtime_dir);
        sockets.push(runtime_dir.join("docker.sock"));
        sockets.push(runtime_dir.join("podman/podman.sock"));
    }
    sockets
}
