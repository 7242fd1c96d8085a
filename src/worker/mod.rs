//! Worker runtime that runs inside the sandbox.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Sandbox container                             │
//! │                                               │
//! │  agentbox worker                              │
//! │    └─ loads or seeds the transcript           │
//! │    └─ runs the decision loop                  │
//! │    └─ exits 0 / 2 / 130 with the outcome      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! The orchestrator learns the outcome only from the exit status, and the
//! results only from the workspace it archives afterwards.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::agent::{DecisionLoop, LoopOutcome, LoopSettings, system_prompt};
use crate::config::WorkerConfig;
use crate::error::{Error, WorkerError};
use crate::history::Transcript;
use crate::llm::{LlmProvider, create_llm_provider};
use crate::tools::builtin::CodeSession;
use crate::tools::{CAPABILITIES, CapabilityRegistry, ToolContext};

/// Exit status for a worker that could not run the loop at all.
pub const FATAL_EXIT_CODE: i32 = 1;

/// One job's agent, wired to its workspace and model.
pub struct WorkerRuntime {
    config: WorkerConfig,
    llm: Arc<dyn LlmProvider>,
}

impl WorkerRuntime {
    /// Build a runtime talking to the configured OpenAI-compatible endpoint.
    pub fn new(config: WorkerConfig) -> Result<Self, Error> {
        let llm = create_llm_provider(&config.llm)?;
        Self::with_provider(config, llm)
    }

    /// Build a runtime around an existing provider.
    pub fn with_provider(config: WorkerConfig, llm: Arc<dyn LlmProvider>) -> Result<Self, Error> {
        if config.task.trim().is_empty() {
            return Err(WorkerError::MissingTask.into());
        }
        Ok(Self { config, llm })
    }

    /// Run the task to a terminal outcome.
    pub async fn run(self, cancel: CancellationToken) -> Result<LoopOutcome, Error> {
        let span = tracing::info_span!(
            "worker",
            job_id = self.config.job_id.as_deref().unwrap_or("-"),
            model = self.llm.model_name(),
        );
        self.run_inner(cancel).instrument(span).await
    }

    async fn run_inner(self, cancel: CancellationToken) -> Result<LoopOutcome, Error> {
        let WorkerConfig {
            task,
            workspace,
            transcript_path,
            agent,
            ..
        } = self.config;

        tokio::fs::create_dir_all(&workspace)
            .await
            .map_err(|e| WorkerError::ExecutionFailed {
                reason: format!("cannot create workspace {}: {e}", workspace.display()),
            })?;

        let prompt = system_prompt(CAPABILITIES);
        let transcript = Transcript::load_or_seed(&transcript_path, &prompt, &task).await?;

        let ctx = ToolContext::new(&workspace, agent.tool_timeout);
        let code = CodeSession::new(
            agent.python.clone(),
            &workspace,
            agent.code_idle_timeout,
            agent.tool_timeout,
        );
        let capabilities = CapabilityRegistry::new(ctx, code);

        tracing::info!(
            workspace = %workspace.display(),
            transcript = %transcript_path.display(),
            "Starting decision loop"
        );
        let mut decision_loop = DecisionLoop::new(
            self.llm,
            capabilities,
            transcript,
            LoopSettings::from(&agent),
            cancel,
        );
        let outcome = decision_loop.run().await?;

        match &outcome {
            LoopOutcome::Done { summary } => {
                tracing::info!(summary = summary.as_deref().unwrap_or(""), "Task finished")
            }
            LoopOutcome::Failed { reason } => tracing::error!(%reason, "Task failed"),
            LoopOutcome::Cancelled => tracing::warn!("Task cancelled"),
        }
        Ok(outcome)
    }
}
