//! Docker-backed sandbox provisioner.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig, PortBinding};
use tokio::sync::RwLock;

use crate::config::SandboxConfig;
use crate::error::OrchestratorError;
use crate::sandbox::{
    ProvisionRequest, SandboxHandle, SandboxProvisioner, SandboxState, connect_docker,
};

/// Prefix of every sandbox container name.
pub const CONTAINER_NAME_PREFIX: &str = "agent-job-";

/// Launches one container per job from the configured base image.
pub struct DockerProvisioner {
    config: SandboxConfig,
    /// Cached Docker connection (created on first use).
    docker: Arc<RwLock<Option<bollard::Docker>>>,
}

impl DockerProvisioner {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            docker: Arc::new(RwLock::new(None)),
        }
    }

    /// Get or create a Docker connection.
    async fn docker(&self) -> Result<bollard::Docker, OrchestratorError> {
        {
            let guard = self.docker.read().await;
            if let Some(ref d) = *guard {
                return Ok(d.clone());
            }
        }
        let docker = connect_docker()
            .await
            .map_err(|e| OrchestratorError::Docker {
                reason: e.to_string(),
            })?;
        *self.docker.write().await = Some(docker.clone());
        Ok(docker)
    }

    fn container_env(&self, request: &ProvisionRequest) -> Vec<String> {
        let mut env = vec![
            format!("AGENT_TASK={}", request.task),
            format!("AGENT_JOB_ID={}", request.job_id),
            format!("AGENT_WORKSPACE={}", self.config.workspace_path),
        ];
        env.extend(self.config.credentials.env_entries());
        env
    }

    fn container_config(&self, request: &ProvisionRequest, bind: String) -> Config<String> {
        let view_port = format!("{}/tcp", self.config.view_port);

        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = [(
            view_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(request.host_port.to_string()),
            }]),
        )]
        .into_iter()
        .collect();
        let exposed_ports: HashMap<String, HashMap<(), ()>> =
            [(view_port, HashMap::new())].into_iter().collect();

        let host_config = HostConfig {
            binds: Some(vec![bind]),
            port_bindings: Some(port_bindings),
            memory: Some((self.config.memory_limit_mb * 1024 * 1024) as i64),
            cpu_shares: Some(self.config.cpu_shares as i64),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        Config {
            image: Some(self.config.image.clone()),
            cmd: Some(vec!["agentbox".to_string(), "worker".to_string()]),
            env: Some(self.container_env(request)),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            working_dir: Some(self.config.workspace_path.clone()),
            ..Default::default()
        }
    }
}

#[async_trait]
impl SandboxProvisioner for DockerProvisioner {
    async fn provision(
        &self,
        request: &ProvisionRequest,
    ) -> Result<SandboxHandle, OrchestratorError> {
        let job_id = request.job_id;
        let workspace = request.workspace.canonicalize().map_err(|e| {
            OrchestratorError::ProvisioningFailed {
                job_id,
                reason: format!(
                    "failed to canonicalize workspace {}: {}",
                    request.workspace.display(),
                    e
                ),
            }
        })?;
        let bind = format!(
            "{}:{}:rw",
            workspace.display(),
            self.config.workspace_path
        );

        let docker = self
            .docker()
            .await
            .map_err(|e| OrchestratorError::ProvisioningFailed {
                job_id,
                reason: e.to_string(),
            })?;

        let name = format!("{CONTAINER_NAME_PREFIX}{job_id}");
        let options = CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        };

        let response = docker
            .create_container(Some(options), self.container_config(request, bind))
            .await
            .map_err(|e| OrchestratorError::ProvisioningFailed {
                job_id,
                reason: e.to_string(),
            })?;
        let container_id = response.id;

        if let Err(e) = docker.start_container::<String>(&container_id, None).await {
            // Leave nothing behind for a job that never started.
            if let Err(cleanup) = docker
                .remove_container(
                    &container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await
            {
                tracing::warn!(job_id = %job_id, error = %cleanup, "Failed to remove unstarted container");
            }
            return Err(OrchestratorError::ProvisioningFailed {
                job_id,
                reason: format!("failed to start container: {}", e),
            });
        }

        tracing::info!(
            job_id = %job_id,
            container = %name,
            host_port = request.host_port,
            "Created and started sandbox container"
        );

        Ok(SandboxHandle {
            id: container_id,
            name,
        })
    }

    async fn inspect(&self, handle: &SandboxHandle) -> Result<SandboxState, OrchestratorError> {
        let docker = self
            .docker()
            .await
            .map_err(|e| OrchestratorError::StatusQueryFailed {
                handle: handle.to_string(),
                reason: e.to_string(),
            })?;

        match docker
            .inspect_container(&handle.id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => {
                let state = info.state.unwrap_or_default();
                Ok(map_container_status(state.status, state.exit_code))
            }
            Err(e) if is_not_found(&e) => Ok(SandboxState::NotFound),
            Err(e) => Err(OrchestratorError::StatusQueryFailed {
                handle: handle.to_string(),
                reason: e.to_string(),
            }),
        }
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), OrchestratorError> {
        let docker = self.docker().await?;
        match docker
            .remove_container(
                &handle.id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(OrchestratorError::Docker {
                reason: format!("failed to remove {}: {}", handle, e),
            }),
        }
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Collapse Docker's container states into what the reconciler cares about.
fn map_container_status(
    status: Option<ContainerStateStatusEnum>,
    exit_code: Option<i64>,
) -> SandboxState {
    match status {
        Some(ContainerStateStatusEnum::EXITED)
        | Some(ContainerStateStatusEnum::DEAD)
        | Some(ContainerStateStatusEnum::REMOVING) => SandboxState::Exited { exit_code },
        _ => SandboxState::Running,
    }
}
