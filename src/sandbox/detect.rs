//! Container runtime detection at start-up.
//!
//! `agentbox serve` checks whether Docker or Podman is installed (binary on
//! PATH) and running (daemon answers a ping). When it is not, the caller logs
//! a platform-specific hint; jobs submitted meanwhile fail to provision.

use std::fmt;

/// Which container runtime binary was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerRuntime {
    Docker,
    Podman,
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ContainerRuntime::Docker => "Docker",
            ContainerRuntime::Podman => "Podman",
        })
    }
}

/// Daemon availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerStatus {
    Available(ContainerRuntime),
    NotInstalled,
    NotRunning(ContainerRuntime),
}

impl DockerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DockerStatus::Available(_))
    }

    /// What the operator should do next, for the current platform.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            DockerStatus::Available(_) => None,
            DockerStatus::NotInstalled => Some(install_hint(std::env::consts::OS)),
            DockerStatus::NotRunning(_) => Some(start_hint(std::env::consts::OS)),
        }
    }
}

fn install_hint(os: &str) -> &'static str {
    match os {
        "macos" => {
            "Install Docker Desktop (https://docs.docker.com/desktop/install/mac-install/) \
             or Podman Desktop (https://podman-desktop.io/)"
        }
        "windows" => {
            "Install Docker Desktop (https://docs.docker.com/desktop/install/windows-install/) \
             or Podman Desktop (https://podman-desktop.io/)"
        }
        _ => {
            "Install Docker Engine (https://docs.docker.com/engine/install/) \
             or Podman (https://podman.io/docs/installation)"
        }
    }
}

fn start_hint(os: &str) -> &'static str {
    match os {
        "macos" => "Start Docker Desktop (open -a Docker) or run: podman machine start",
        "windows" => "Start Docker Desktop or Podman Desktop from the Start menu",
        _ => "Run: sudo systemctl start docker, or: systemctl --user start podman.socket",
    }
}

/// Check whether a container runtime is installed and its daemon reachable.
///
/// Docker is preferred when both binaries are present.
pub async fn check_docker() -> DockerStatus {
    let runtime = if binary_exists("docker") {
        ContainerRuntime::Docker
    } else if binary_exists("podman") {
        ContainerRuntime::Podman
    } else {
        return DockerStatus::NotInstalled;
    };

    // bollard speaks to Podman's Docker-compatible socket as well.
    match crate::sandbox::connect_docker().await {
        Ok(_) => DockerStatus::Available(runtime),
        Err(e) => {
            tracing::debug!(error = %e, "Container runtime ping failed");
            DockerStatus::NotRunning(runtime)
        }
    }
}

fn binary_exists(name: &str) -> bool {
    let finder = if cfg!(windows) { "where" } else { "which" };
    std::process::Command::new(finder)
        .arg(name)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
