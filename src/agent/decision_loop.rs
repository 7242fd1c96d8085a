//! The think / parse / dispatch / record cycle.
//!
//! ```text
//!   Init ──► Think ──► Parse ──► Dispatch ──► Record ──┐
//!              ▲         │ recoverable error            │
//!              └─────────┴──────────────────────────────┘
//!   terminal: Done (finish_task) | Failed (retry budget, iteration cap) | Cancelled
//! ```
//!
//! Strictly sequential: one model call or one capability call at a time.
//! The transcript is persisted after every iteration, so a restarted worker
//! picks up where the previous one stopped.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AgentConfig;
use crate::error::{LlmError, WorkerError};
use crate::history::Transcript;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};
use crate::tools::{Capability, CapabilityRegistry, InvocationError, ToolInvocation};
use crate::util::backoff_delay;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    /// The model called `finish_task`.
    Done { summary: Option<String> },
    /// The loop gave up.
    Failed { reason: String },
    /// The cancellation token fired.
    Cancelled,
}

impl LoopOutcome {
    /// Process exit status reported to the orchestrator.
    pub fn exit_code(&self) -> i32 {
        match self {
            LoopOutcome::Done { .. } => 0,
            LoopOutcome::Failed { .. } => 2,
            LoopOutcome::Cancelled => 130,
        }
    }
}

/// Tuning knobs of the loop.
#[derive(Debug, Clone)]
pub struct LoopSettings {
    /// Messages per model call (first two plus the most recent `cap - 2`).
    pub context_cap: usize,
    /// The run fails once this many recoverable errors happen in a row.
    pub retry_budget: u32,
    pub max_iterations: u32,
    /// Backoff after a failed model call.
    pub llm_backoff_base: Duration,
    pub llm_backoff_max: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for LoopSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            context_cap: config.context_cap,
            retry_budget: config.retry_budget,
            max_iterations: config.max_iterations,
            llm_backoff_base: Duration::from_secs(1),
            llm_backoff_max: Duration::from_secs(30),
        }
    }
}

enum Step {
    Continue,
    Finish(LoopOutcome),
}

/// Drives one task to completion against a model and a capability registry.
pub struct DecisionLoop {
    llm: Arc<dyn LlmProvider>,
    capabilities: CapabilityRegistry,
    transcript: Transcript,
    settings: LoopSettings,
    cancel: CancellationToken,
    consecutive_errors: u32,
}

impl DecisionLoop {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        capabilities: CapabilityRegistry,
        transcript: Transcript,
        settings: LoopSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            llm,
            capabilities,
            transcript,
            settings,
            cancel,
            consecutive_errors: 0,
        }
    }

    /// Run until a terminal state. Capability backends are shut down on
    /// every exit path, including errors.
    pub async fn run(&mut self) -> Result<LoopOutcome, WorkerError> {
        let result = self.run_inner().await;
        self.capabilities.shutdown().await;
        result
    }

    async fn run_inner(&mut self) -> Result<LoopOutcome, WorkerError> {
        self.transcript.save().await?;

        for iteration in 1..=self.settings.max_iterations {
            tracing::debug!(iteration, messages = self.transcript.len(), "Thinking");
            if let Step::Finish(outcome) = self.iterate().await? {
                return Ok(outcome);
            }
        }

        let reason = format!(
            "iteration limit of {} reached without finishing the task",
            self.settings.max_iterations
        );
        self.fail(reason).await
    }

    async fn iterate(&mut self) -> Result<Step, WorkerError> {
        // Think
        let request = CompletionRequest::new(self.transcript.pruned(self.settings.context_cap)).json();
        let response = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.cancelled().await.map(Step::Finish),
            response = self.llm.complete(request) => response,
        };
        let content = match response {
            Ok(response) => response.content,
            Err(e) => return self.model_failed(e).await,
        };

        // Parse
        self.transcript.push(ChatMessage::assistant(content.clone()));
        let capability = match ToolInvocation::parse(&content).and_then(Capability::from_invocation)
        {
            Ok(capability) => capability,
            Err(e) => return self.recoverable(corrective_message(&e, &content)).await,
        };
        self.consecutive_errors = 0;

        // Dispatch
        if let Capability::FinishTask(args) = &capability {
            tracing::info!(summary = ?args.summary, "Agent decided to finish the task");
            self.transcript.save().await?;
            return Ok(Step::Finish(LoopOutcome::Done {
                summary: args.summary.clone(),
            }));
        }

        let name = capability.name();
        tracing::info!(tool = name, "Calling tool");
        let observation = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return self.cancelled().await.map(Step::Finish),
            observation = self.capabilities.execute(&capability) => observation,
        };

        // Record
        self.transcript.push(ChatMessage::system(format!(
            "Observation from tool {name}:\n{observation}"
        )));
        self.transcript.save().await?;
        Ok(Step::Continue)
    }

    /// A model call failed: back off and try again while the budget lasts.
    /// Rejected credentials never recover, so they end the run at once.
    async fn model_failed(&mut self, error: LlmError) -> Result<Step, WorkerError> {
        if matches!(error, LlmError::AuthFailed { .. }) {
            return self
                .fail(format!("model endpoint rejected the credentials: {error}"))
                .await
                .map(Step::Finish);
        }

        self.consecutive_errors += 1;
        tracing::warn!(error = %error, attempt = self.consecutive_errors, "Model call failed");
        if self.consecutive_errors >= self.settings.retry_budget {
            let reason = format!(
                "{} consecutive errors; last model error: {}",
                self.consecutive_errors, error
            );
            return self.fail(reason).await.map(Step::Finish);
        }

        let delay = match &error {
            LlmError::RateLimited {
                retry_after: Some(hint),
                ..
            } => (*hint).min(self.settings.llm_backoff_max),
            _ => backoff_delay(
                self.settings.llm_backoff_base,
                self.settings.llm_backoff_max,
                self.consecutive_errors - 1,
            ),
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => self.cancelled().await.map(Step::Finish),
            _ = tokio::time::sleep(delay) => Ok(Step::Continue),
        }
    }

    /// The model's turn could not be used. Tell it why and let it retry.
    async fn recoverable(&mut self, correction: String) -> Result<Step, WorkerError> {
        self.consecutive_errors += 1;
        tracing::warn!(attempt = self.consecutive_errors, correction = %correction, "Recoverable error");
        self.transcript.push(ChatMessage::system(correction.clone()));

        if self.consecutive_errors >= self.settings.retry_budget {
            let reason = format!(
                "{} consecutive invalid responses; last: {}",
                self.consecutive_errors, correction
            );
            return self.fail(reason).await.map(Step::Finish);
        }
        self.transcript.save().await?;
        Ok(Step::Continue)
    }

    async fn fail(&mut self, reason: String) -> Result<LoopOutcome, WorkerError> {
        tracing::error!(%reason, "Giving up on the task");
        self.transcript
            .push(ChatMessage::system(format!("Stopping: {reason}")));
        self.transcript.save().await?;
        Ok(LoopOutcome::Failed { reason })
    }

    async fn cancelled(&mut self) -> Result<LoopOutcome, WorkerError> {
        tracing::warn!("Cancelled");
        self.transcript
            .push(ChatMessage::system("Stopping: the job was cancelled."));
        self.transcript.save().await?;
        Ok(LoopOutcome::Cancelled)
    }
}

/// The system message that tells the model what was wrong with its reply.
pub fn corrective_message(error: &InvocationError, response: &str) -> String {
    match error {
        InvocationError::Empty => "Invalid response. Please respond with a valid JSON object. \
                                   Your last response was empty."
            .to_string(),
        InvocationError::InvalidJson(_) => format!(
            "Invalid JSON. Please respond with a valid JSON object. Response was: {response}"
        ),
        InvocationError::UnknownTool(name) => format!("Error: Tool '{name}' not found."),
        InvocationError::InvalidArguments { tool, reason } => {
            let expected = crate::tools::find_spec(tool)
                .map(|spec| spec.param_names().join(", "))
                .unwrap_or_default();
            format!(
                "Error: invalid arguments for tool '{tool}': {reason}. Expected arguments: `{expected}`."
            )
        }
    }
}
