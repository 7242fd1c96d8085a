//! Error types for agentbox.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("History error: {0}")]
    History(#[from] HistoryError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),
}

/// Orchestrator errors (job submission, sandbox management, archiving).
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("Invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Workspace {} for job {job_id} already exists", .path.display())]
    WorkspaceConflict { job_id: Uuid, path: PathBuf },

    #[error("Failed to prepare workspace {} for job {job_id}: {reason}", .path.display())]
    Workspace {
        job_id: Uuid,
        path: PathBuf,
        reason: String,
    },

    #[error("No free sandbox port in {start}..{end}")]
    PortsExhausted { start: u16, end: u16 },

    #[error("Failed to provision sandbox for job {job_id}: {reason}")]
    ProvisioningFailed { job_id: Uuid, reason: String },

    #[error("Failed to query sandbox {handle}: {reason}")]
    StatusQueryFailed { handle: String, reason: String },

    #[error("Failed to archive workspace for job {job_id}: {reason}")]
    ArchiveFailed { job_id: Uuid, reason: String },

    #[error("Job {job_id} already registered")]
    DuplicateJob { job_id: Uuid },

    #[error("Job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Docker error: {reason}")]
    Docker { reason: String },
}

/// Worker errors (in-sandbox execution).
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("No task given (AGENT_TASK not set)")]
    MissingTask,

    #[error("Worker execution failed: {reason}")]
    ExecutionFailed { reason: String },

    #[error("Transcript error: {0}")]
    Transcript(#[from] HistoryError),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },
}

/// Transcript persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Failed to {action} transcript at {}: {source}", .path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcript at {} is malformed: {reason}", .path.display())]
    Malformed { path: PathBuf, reason: String },

    #[error("Failed to serialize transcript: {0}")]
    Serialization(#[from] serde_json::Error),
}
