//! Decision loop behaviour against a scripted model.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use agentbox::agent::{DecisionLoop, LoopOutcome, LoopSettings, system_prompt};
use agentbox::error::LlmError;
use agentbox::history::Transcript;
use agentbox::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider,
    ResponseFormat, Role,
};
use agentbox::tools::builtin::CodeSession;
use agentbox::tools::{CAPABILITIES, CapabilityRegistry, ToolContext};

/// Replays canned replies and records every request it receives.
struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn ok(replies: &[&str]) -> Arc<Self> {
        Self::new(replies.iter().map(|r| Ok(r.to_string())).collect())
    }

    fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front().unwrap_or_else(|| {
            Err(LlmError::InvalidResponse {
                provider: "scripted".to_string(),
                reason: "script exhausted".to_string(),
            })
        })?;
        Ok(CompletionResponse {
            content: reply,
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: FinishReason::Stop,
        })
    }
}

fn settings(retry_budget: u32) -> LoopSettings {
    LoopSettings {
        context_cap: 20,
        retry_budget,
        max_iterations: 20,
        llm_backoff_base: Duration::from_millis(1),
        llm_backoff_max: Duration::from_millis(5),
    }
}

fn transcript_path(workspace: &Path) -> std::path::PathBuf {
    workspace.join(".agent/transcript.json")
}

fn decision_loop(
    workspace: &Path,
    llm: Arc<ScriptedLlm>,
    settings: LoopSettings,
    cancel: CancellationToken,
) -> DecisionLoop {
    let transcript = Transcript::seed(
        transcript_path(workspace),
        &system_prompt(CAPABILITIES),
        "tidy the workspace",
    );
    let capabilities = CapabilityRegistry::new(
        ToolContext::new(workspace, Duration::from_secs(10)),
        CodeSession::new(
            "python3",
            workspace,
            Duration::from_millis(200),
            Duration::from_secs(10),
        ),
    );
    DecisionLoop::new(llm, capabilities, transcript, settings, cancel)
}

async fn saved(workspace: &Path) -> Vec<ChatMessage> {
    Transcript::load(transcript_path(workspace))
        .await
        .unwrap()
        .expect("transcript should be persisted")
        .messages()
        .to_vec()
}

const FINISH: &str = r#"{"tool_name": "finish_task", "args": {"summary": "all done"}}"#;

#[tokio::test]
async fn runs_capability_then_finishes() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("notes.txt"), "x").unwrap();
    let llm = ScriptedLlm::ok(&[r#"{"tool_name": "list_files", "args": {"path": "."}}"#, FINISH]);

    let mut agent = decision_loop(dir.path(), llm.clone(), settings(3), CancellationToken::new());
    let outcome = agent.run().await.unwrap();
    assert_eq!(
        outcome,
        LoopOutcome::Done {
            summary: Some("all done".to_string())
        }
    );

    let messages = saved(dir.path()).await;
    let roles: Vec<Role> = messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::System, Role::User, Role::Assistant, Role::System, Role::Assistant]
    );
    assert_eq!(messages[1].content, "The user's task is: tidy the workspace");
    assert!(messages[3].content.starts_with("Observation from tool list_files:\n"));
    assert!(messages[3].content.contains("notes.txt"));
    assert_eq!(messages[4].content, FINISH);

    let requests = llm.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.response_format == ResponseFormat::JsonObject));
}

#[tokio::test]
async fn recovers_from_invalid_json() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::ok(&["Sure, let me look around first.", FINISH]);

    let mut agent = decision_loop(dir.path(), llm, settings(3), CancellationToken::new());
    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome.exit_code(), 0);

    let messages = saved(dir.path()).await;
    assert_eq!(
        messages[3],
        ChatMessage::system(
            "Invalid JSON. Please respond with a valid JSON object. Response was: \
             Sure, let me look around first."
        )
    );
}

#[tokio::test]
async fn retry_budget_exhaustion_fails() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::ok(&[
        "",
        r#"{"tool_name": "teleport", "args": {}}"#,
        r#"{"tool_name": "write_file", "args": {"path": "a.txt"}}"#,
        FINISH,
    ]);

    let mut agent = decision_loop(dir.path(), llm.clone(), settings(3), CancellationToken::new());
    let outcome = agent.run().await.unwrap();
    assert!(matches!(outcome, LoopOutcome::Failed { .. }), "{outcome:?}");
    assert_eq!(outcome.exit_code(), 2);
    assert_eq!(llm.requests().len(), 3, "finish_task must never be requested");

    let messages = saved(dir.path()).await;
    let system: Vec<&str> = messages[2..]
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(system.len(), 4);
    assert!(system[0].ends_with("Your last response was empty."));
    assert_eq!(system[1], "Error: Tool 'teleport' not found.");
    assert!(system[2].starts_with("Error: invalid arguments for tool 'write_file'"));
    assert!(system[3].starts_with("Stopping:"));
}

#[tokio::test]
async fn successful_dispatch_resets_retry_budget() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::ok(&[
        "oops",
        r#"{"tool_name": "write_file", "args": {"path": "a.txt", "content": "1"}}"#,
        "oops again",
        FINISH,
    ]);

    let mut agent = decision_loop(dir.path(), llm, settings(2), CancellationToken::new());
    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "1");
}

#[tokio::test]
async fn capability_failure_is_an_observation() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::ok(&[
        r#"{"tool_name": "read_file", "args": {"path": "missing.txt"}}"#,
        FINISH,
    ]);

    let mut agent = decision_loop(dir.path(), llm, settings(1), CancellationToken::new());
    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome.exit_code(), 0);

    let messages = saved(dir.path()).await;
    assert!(
        messages[3]
            .content
            .starts_with("Observation from tool read_file:\nError reading file:")
    );
}

#[tokio::test]
async fn model_errors_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::new(vec![
        Err(LlmError::RequestFailed {
            provider: "scripted".to_string(),
            reason: "connection reset".to_string(),
        }),
        Err(LlmError::RateLimited {
            provider: "scripted".to_string(),
            retry_after: Some(Duration::from_millis(1)),
        }),
        Ok(FINISH.to_string()),
    ]);

    let mut agent = decision_loop(dir.path(), llm.clone(), settings(3), CancellationToken::new());
    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(llm.requests().len(), 3);
}

#[tokio::test]
async fn rejected_credentials_fail_without_retrying() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::new(vec![
        Err(LlmError::AuthFailed {
            provider: "scripted".to_string(),
        }),
        Ok(FINISH.to_string()),
    ]);

    let mut agent = decision_loop(dir.path(), llm.clone(), settings(5), CancellationToken::new());
    let outcome = agent.run().await.unwrap();
    assert!(
        matches!(&outcome, LoopOutcome::Failed { reason } if reason.contains("credentials")),
        "{outcome:?}"
    );
    assert_eq!(llm.requests().len(), 1);

    let messages = saved(dir.path()).await;
    assert!(messages.last().unwrap().content.starts_with("Stopping:"));
}

#[tokio::test]
async fn model_sees_pruned_view_only() {
    let dir = tempfile::tempdir().unwrap();
    let list = r#"{"tool_name": "list_files", "args": {}}"#;
    let llm = ScriptedLlm::ok(&[list, list, list, FINISH]);

    let mut settings = settings(3);
    settings.context_cap = 4;
    let mut agent = decision_loop(dir.path(), llm.clone(), settings, CancellationToken::new());
    agent.run().await.unwrap();

    for request in llm.requests() {
        assert!(request.messages.len() <= 4);
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages[1].role, Role::User);
    }
    let last = llm.requests().pop().unwrap();
    assert_eq!(last.messages[2].role, Role::Assistant);
    assert_eq!(last.messages[3].role, Role::System);

    // The persisted transcript keeps everything.
    assert_eq!(saved(dir.path()).await.len(), 2 + 3 * 2 + 1);
}

#[tokio::test]
async fn iteration_cap_fails() {
    let dir = tempfile::tempdir().unwrap();
    let list = r#"{"tool_name": "list_files", "args": {}}"#;
    let llm = ScriptedLlm::ok(&[list, list, list]);

    let mut settings = settings(3);
    settings.max_iterations = 2;
    let mut agent = decision_loop(dir.path(), llm.clone(), settings, CancellationToken::new());
    let outcome = agent.run().await.unwrap();
    assert!(matches!(outcome, LoopOutcome::Failed { .. }));
    assert_eq!(llm.requests().len(), 2);
}

#[tokio::test]
async fn cancellation_stops_before_thinking() {
    let dir = tempfile::tempdir().unwrap();
    let llm = ScriptedLlm::ok(&[FINISH]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut agent = decision_loop(dir.path(), llm.clone(), settings(3), cancel);
    let outcome = agent.run().await.unwrap();
    assert_eq!(outcome, LoopOutcome::Cancelled);
    assert_eq!(outcome.exit_code(), 130);
    assert!(llm.requests().is_empty());

    let messages = saved(dir.path()).await;
    assert!(messages.last().unwrap().content.contains("cancelled"));
}

#[tokio::test]
async fn resumes_persisted_transcript() {
    let dir = tempfile::tempdir().unwrap();
    let first = ScriptedLlm::ok(&[r#"{"tool_name": "list_files", "args": {}}"#]);
    let mut agent = decision_loop(dir.path(), first, settings(1), CancellationToken::new());
    // The script runs dry after one capability call, so the run fails.
    let outcome = agent.run().await.unwrap();
    assert!(matches!(outcome, LoopOutcome::Failed { .. }));
    let before = saved(dir.path()).await.len();

    let resumed = Transcript::load_or_seed(
        transcript_path(dir.path()),
        &system_prompt(CAPABILITIES),
        "tidy the workspace",
    )
    .await
    .unwrap();
    assert_eq!(resumed.len(), before);
}
