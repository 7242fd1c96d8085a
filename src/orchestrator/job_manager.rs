//! Job lifecycle: scheduling, status reconciliation and archiving.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::orchestrator::archive::Archiver;
use crate::orchestrator::ports::PortAllocator;
use crate::orchestrator::reconciler;
use crate::orchestrator::registry::{JobRecord, JobRegistry, JobStatus};
use crate::sandbox::{ProvisionRequest, SandboxProvisioner};

/// Result of a successful submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduledJob {
    pub job_id: Uuid,
    pub port: u16,
}

/// Owns every job from submission until its workspace is archived.
pub struct JobManager {
    workspaces_dir: PathBuf,
    registry: Arc<JobRegistry>,
    ports: Arc<PortAllocator>,
    archiver: Arc<Archiver>,
    provisioner: Arc<dyn SandboxProvisioner>,
}

impl JobManager {
    pub fn new(
        workspaces_dir: impl Into<PathBuf>,
        ports: PortAllocator,
        archiver: Archiver,
        provisioner: Arc<dyn SandboxProvisioner>,
    ) -> Self {
        Self {
            workspaces_dir: workspaces_dir.into(),
            registry: Arc::new(JobRegistry::new()),
            ports: Arc::new(ports),
            archiver: Arc::new(archiver),
            provisioner,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn downloads_dir(&self) -> &Path {
        self.archiver.downloads_dir()
    }

    /// Accept a task: create its workspace, reserve a port, start its sandbox.
    ///
    /// Nothing is registered unless the sandbox started; on failure the port
    /// and workspace are given back.
    pub async fn schedule(&self, prompt: &str) -> Result<ScheduledJob, OrchestratorError> {
        if prompt.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest {
                reason: "prompt must not be empty".to_string(),
            });
        }

        let job_id = Uuid::new_v4();
        let workspace = self.create_workspace(job_id).await?;

        let port = match self.ports.allocate() {
            Ok(port) => port,
            Err(e) => {
                remove_workspace(job_id, &workspace).await;
                return Err(e);
            }
        };

        let request = ProvisionRequest {
            job_id,
            task: prompt.to_string(),
            workspace: workspace.clone(),
            host_port: port,
        };
        let sandbox = match self.provisioner.provision(&request).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Sandbox provisioning failed");
                self.ports.release(port);
                remove_workspace(job_id, &workspace).await;
                return Err(match e {
                    OrchestratorError::ProvisioningFailed { .. } => e,
                    other => OrchestratorError::ProvisioningFailed {
                        job_id,
                        reason: other.to_string(),
                    },
                });
            }
        };

        let record = JobRecord {
            id: job_id,
            prompt: prompt.to_string(),
            status: JobStatus::Running,
            sandbox,
            workspace,
            port,
            download_url: None,
            created_at: Utc::now(),
        };
        self.registry.insert(record).await?;

        tracing::info!(job_id = %job_id, port, "Job scheduled");
        Ok(ScheduledJob { job_id, port })
    }

    /// Current state of a job, refreshed from its sandbox.
    ///
    /// The first time a job is seen terminated its port is released and its
    /// workspace archived. Safe to call as often as clients like.
    pub async fn status(&self, job_id: &str) -> Result<JobRecord, OrchestratorError> {
        let not_found = || OrchestratorError::NotFound {
            id: job_id.to_string(),
        };
        let id = Uuid::parse_str(job_id).map_err(|_| not_found())?;
        let mut record = self.registry.get(id).await.ok_or_else(not_found)?;

        if record.status == JobStatus::Running {
            let observed = self.provisioner.inspect(&record.sandbox).await?;
            let next = reconciler::observe(record.status, observed);
            if next != record.status {
                match self.registry.transition(id, next).await {
                    Ok(true) => {
                        self.ports.release(record.port);
                        tracing::info!(job_id = %id, status = %next, ?observed, "Sandbox terminated");
                    }
                    // A concurrent poll settled the job first.
                    Ok(false) | Err(OrchestratorError::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
                record = self.registry.get(id).await.ok_or_else(not_found)?;
            }
        }

        if record.status.is_terminal() && record.download_url.is_none() {
            return self.archive_once(id).await;
        }
        Ok(record)
    }

    /// Archive a terminated job's workspace exactly once.
    async fn archive_once(&self, id: Uuid) -> Result<JobRecord, OrchestratorError> {
        let guard = self.archiver.guard(id);
        let _lock = guard.lock().await;

        let record = self.registry.get(id).await.ok_or(OrchestratorError::NotFound {
            id: id.to_string(),
        })?;
        if record.download_url.is_some() {
            self.archiver.release_guard(id);
            return Ok(record);
        }

        self.archiver.archive(id, &record.workspace).await?;
        self.registry
            .set_download_url(id, Archiver::download_url(id))
            .await?;
        self.archiver.release_guard(id);
        let record = self.registry.get(id).await.ok_or(OrchestratorError::NotFound {
            id: id.to_string(),
        })?;

        self.spawn_reclaim(record.clone());
        Ok(record)
    }

    /// Remove the sandbox of an archived job in the background.
    fn spawn_reclaim(&self, record: JobRecord) {
        let provisioner = Arc::clone(&self.provisioner);
        let registry = Arc::clone(&self.registry);
        tokio::spawn(async move {
            if let Err(e) = provisioner.remove(&record.sandbox).await {
                tracing::warn!(job_id = %record.id, error = %e, "Failed to remove sandbox (may require manual cleanup)");
            }
            if record.status == JobStatus::Exited
                && let Err(e) = registry.transition(record.id, JobStatus::Archived).await
            {
                tracing::warn!(job_id = %record.id, error = %e, "Failed to mark job archived");
            }
        });
    }

    async fn create_workspace(&self, job_id: Uuid) -> Result<PathBuf, OrchestratorError> {
        let workspace_error = |path: &Path, reason: String| OrchestratorError::Workspace {
            job_id,
            path: path.to_path_buf(),
            reason,
        };

        tokio::fs::create_dir_all(&self.workspaces_dir)
            .await
            .map_err(|e| workspace_error(&self.workspaces_dir, e.to_string()))?;

        let workspace = self.workspaces_dir.join(job_id.to_string());
        match tokio::fs::create_dir(&workspace).await {
            Ok(()) => Ok(workspace),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(OrchestratorError::WorkspaceConflict {
                    job_id,
                    path: workspace,
                })
            }
            Err(e) => Err(workspace_error(&workspace, e.to_string())),
        }
    }
}

async fn remove_workspace(job_id: Uuid, workspace: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(workspace).await {
        tracing::warn!(job_id = %job_id, path = %workspace.display(), error = %e, "Failed to remove workspace");
    }
}
