//! In-memory job registry.
//!
//! The only state shared across jobs. Records live for the lifetime of the
//! process and are never removed.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::OrchestratorError;
use crate::sandbox::SandboxHandle;

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Exited,
    Archived,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Exited => "exited",
            JobStatus::Archived => "archived",
            JobStatus::Failed => "failed",
        }
    }

    /// The sandbox has stopped.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Running)
    }

    /// Statuses only ever move forward; nothing returns to `Running`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Running, JobStatus::Exited)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Exited, JobStatus::Archived)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything the orchestrator knows about one job.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: Uuid,
    pub prompt: String,
    pub status: JobStatus,
    pub sandbox: SandboxHandle,
    pub workspace: PathBuf,
    /// Host port the sandbox's view port is published on.
    pub port: u16,
    /// Set once by the archiver, immutable afterwards.
    pub download_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Registry of all jobs accepted since start-up.
#[derive(Debug, Default)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job. Rejects an id that is already present.
    pub async fn insert(&self, record: JobRecord) -> Result<(), OrchestratorError> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&record.id) {
            return Err(OrchestratorError::DuplicateJob { job_id: record.id });
        }
        jobs.insert(record.id, record);
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Option<JobRecord> {
        self.jobs.read().await.get(&id).cloned()
    }

    /// All jobs, oldest first.
    pub async fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Move a job to `next`.
    ///
    /// Returns `Ok(false)` when the job is already in `next` so repeated
    /// observations are harmless; any backwards or sideways move is an error.
    pub async fn transition(&self, id: Uuid, next: JobStatus) -> Result<bool, OrchestratorError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| OrchestratorError::NotFound {
            id: id.to_string(),
        })?;

        if job.status == next {
            return Ok(false);
        }
        if !job.status.can_transition_to(next) {
            return Err(OrchestratorError::InvalidTransition {
                job_id: id,
                from: job.status.to_string(),
                to: next.to_string(),
            });
        }

        tracing::debug!(job_id = %id, from = %job.status, to = %next, "Job status transition");
        job.status = next;
        Ok(true)
    }

    /// Record the download reference. The first value wins and is returned on
    /// every later call.
    pub async fn set_download_url(
        &self,
        id: Uuid,
        url: String,
    ) -> Result<String, OrchestratorError> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(&id).ok_or_else(|| OrchestratorError::NotFound {
            id: id.to_string(),
        })?;
        Ok(job.download_url.get_or_insert(url).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: JobStatus) -> JobRecord {
        let id = Uuid::new_v4();
        JobRecord {
            id,
            prompt: "list files".to_string(),
            status,
            sandbox: SandboxHandle {
                id: "c0ffee".to_string(),
                name: format!("agent-job-{id}"),
            },
            workspace: PathBuf::from(format!("/tmp/workspaces/{id}")),
            port: 6080,
            download_url: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_insert_rejects_duplicate_id() {
        let registry = JobRegistry::new();
        let job = record(JobStatus::Running);
        registry.insert(job.clone()).await.unwrap();

        let err = registry.insert(job).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::DuplicateJob { .. }));
        assert_eq!(registry.list().await.len(), 1);
    }

    #[tokio::test]
    async fn test_transitions_are_monotonic() {
        let registry = JobRegistry::new();
        let job = record(JobStatus::Running);
        let id = job.id;
        registry.insert(job).await.unwrap();

        assert!(registry.transition(id, JobStatus::Exited).await.unwrap());
        assert!(!registry.transition(id, JobStatus::Exited).await.unwrap());
        assert!(registry.transition(id, JobStatus::Archived).await.unwrap());

        let err = registry.transition(id, JobStatus::Running).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        assert_eq!(registry.get(id).await.unwrap().status, JobStatus::Archived);
    }

    #[tokio::test]
    async fn test_failed_is_absorbing() {
        let registry = JobRegistry::new();
        let job = record(JobStatus::Running);
        let id = job.id;
        registry.insert(job).await.unwrap();

        registry.transition(id, JobStatus::Failed).await.unwrap();
        assert!(registry.transition(id, JobStatus::Archived).await.is_err());
        assert!(registry.transition(id, JobStatus::Exited).await.is_err());
    }

    #[tokio::test]
    async fn test_download_url_set_once() {
        let registry = JobRegistry::new();
        let job = record(JobStatus::Exited);
        let id = job.id;
        registry.insert(job).await.unwrap();

        let first = registry
            .set_download_url(id, "/downloads/a.tar.gz".to_string())
            .await
            .unwrap();
        let second = registry
            .set_download_url(id, "/downloads/b.tar.gz".to_string())
            .await
            .unwrap();
        assert_eq!(first, "/downloads/a.tar.gz");
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let registry = JobRegistry::new();
        assert!(registry.get(Uuid::new_v4()).await.is_none());
        let err = registry
            .transition(Uuid::new_v4(), JobStatus::Exited)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound { .. }));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Archived).unwrap(),
            "\"archived\""
        );
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }
}
