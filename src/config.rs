//! Configuration for agentbox.
//!
//! Both halves of the system are configured from the environment (a `.env`
//! file is honoured). The orchestrator reads [`OrchestratorConfig`]; the
//! in-sandbox worker reads [`WorkerConfig`], whose variables are injected by
//! the sandbox provisioner.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::error::ConfigError;

/// Fixed path of the workspace inside every sandbox.
pub const DEFAULT_SANDBOX_WORKSPACE: &str = "/home/agent/workspace";

/// Transcript location relative to the workspace root.
pub const TRANSCRIPT_RELATIVE_PATH: &str = ".agent/transcript.json";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Address the HTTP API binds to.
    pub bind_addr: SocketAddr,
    /// Host directory holding one workspace directory per job.
    pub workspaces_dir: PathBuf,
    /// Host directory archives are written to and served from.
    pub downloads_dir: PathBuf,
    pub sandbox: SandboxConfig,
    pub ports: PortRangeConfig,
}

impl OrchestratorConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        Ok(Self {
            bind_addr: parse_optional_env(
                "ORCHESTRATOR_BIND",
                SocketAddr::from(([0, 0, 0, 0], 8000)),
            )?,
            workspaces_dir: optional_env("WORKSPACES_DIR")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("workspaces")),
            downloads_dir: optional_env("DOWNLOADS_DIR")?
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("downloads")),
            sandbox: SandboxConfig::from_env()?,
            ports: PortRangeConfig::from_env()?,
        })
    }
}

/// Settings for the containers the provisioner launches.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Base image every sandbox is created from.
    pub image: String,
    /// Where the job workspace is mounted inside the container.
    pub workspace_path: String,
    /// In-container port published for interactive viewing (noVNC).
    pub view_port: u16,
    /// Memory limit in megabytes.
    pub memory_limit_mb: u64,
    /// CPU shares (relative weight).
    pub cpu_shares: u32,
    /// Credentials and model settings forwarded into each sandbox.
    pub credentials: SandboxCredentials,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "agent-base:latest".to_string(),
            workspace_path: DEFAULT_SANDBOX_WORKSPACE.to_string(),
            view_port: 6080,
            memory_limit_mb: 2048,
            cpu_shares: 1024,
            credentials: SandboxCredentials::default(),
        }
    }
}

impl SandboxConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            image: optional_env("SANDBOX_IMAGE")?.unwrap_or(defaults.image),
            workspace_path: optional_env("SANDBOX_WORKSPACE_PATH")?
                .unwrap_or(defaults.workspace_path),
            view_port: parse_optional_env("SANDBOX_VIEW_PORT", defaults.view_port)?,
            memory_limit_mb: parse_optional_env(
                "SANDBOX_MEMORY_LIMIT_MB",
                defaults.memory_limit_mb,
            )?,
            cpu_shares: parse_optional_env("SANDBOX_CPU_SHARES", defaults.cpu_shares)?,
            credentials: SandboxCredentials::from_env()?,
        })
    }
}

/// LLM credentials the orchestrator injects into sandboxes.
#[derive(Debug, Clone, Default)]
pub struct SandboxCredentials {
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: Option<String>,
}

impl SandboxCredentials {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            api_key: optional_env("OPENAI_API_KEY")?.map(SecretString::from),
            base_url: optional_env("LLM_BASE_URL")?,
            model: optional_env("LLM_MODEL")?,
        })
    }

    /// Render the credentials as container environment entries.
    pub fn env_entries(&self) -> Vec<String> {
        let mut env = Vec::new();
        if let Some(ref key) = self.api_key {
            env.push(format!("OPENAI_API_KEY={}", key.expose_secret()));
        }
        if let Some(ref url) = self.base_url {
            env.push(format!("LLM_BASE_URL={}", url));
        }
        if let Some(ref model) = self.model {
            env.push(format!("LLM_MODEL={}", model));
        }
        env
    }
}

/// Host ports handed out to sandboxes for the published view port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRangeConfig {
    pub base: u16,
    pub count: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            base: 6080,
            count: 100,
        }
    }
}

impl PortRangeConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let base = parse_optional_env("SANDBOX_PORT_BASE", defaults.base)?;
        let count = parse_optional_env("SANDBOX_PORT_COUNT", defaults.count)?;
        if count == 0 {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_PORT_COUNT".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if base.checked_add(count).is_none() {
            return Err(ConfigError::InvalidValue {
                key: "SANDBOX_PORT_COUNT".to_string(),
                message: format!("range starting at {base} overflows the port space"),
            });
        }
        Ok(Self { base, count })
    }

    /// Exclusive end of the range.
    pub fn end(&self) -> u16 {
        self.base.saturating_add(self.count)
    }
}

/// Configuration of the in-sandbox worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// The natural-language task to complete.
    pub task: String,
    /// Job id assigned by the orchestrator (logging only).
    pub job_id: Option<String>,
    /// Workspace root; relative capability paths resolve against it.
    pub workspace: PathBuf,
    /// Where the transcript is persisted.
    pub transcript_path: PathBuf,
    pub llm: LlmConfig,
    pub agent: AgentConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let task = optional_env("AGENT_TASK")?.ok_or_else(|| ConfigError::MissingRequired {
            key: "AGENT_TASK".to_string(),
            hint: "The orchestrator injects the task when it provisions the sandbox".to_string(),
        })?;
        let workspace = optional_env("AGENT_WORKSPACE")?
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SANDBOX_WORKSPACE));
        let transcript_path = optional_env("AGENT_TRANSCRIPT_PATH")?
            .map(PathBuf::from)
            .unwrap_or_else(|| workspace.join(TRANSCRIPT_RELATIVE_PATH));

        Ok(Self {
            task,
            job_id: optional_env("AGENT_JOB_ID")?,
            workspace,
            transcript_path,
            llm: LlmConfig::from_env()?,
            agent: AgentConfig::from_env()?,
        })
    }
}

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
    pub timeout: Duration,
}

impl LlmConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let api_key = optional_env("OPENAI_API_KEY")?
            .map(SecretString::from)
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENAI_API_KEY".to_string()))?;

        Ok(Self {
            api_key,
            base_url: optional_env("LLM_BASE_URL")?
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            model: optional_env("LLM_MODEL")?
                .unwrap_or_else(|| "gpt-4-turbo-preview".to_string()),
            timeout: Duration::from_secs(parse_optional_env("LLM_TIMEOUT_SECS", 120)?),
        })
    }
}

/// Decision loop tuning.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Maximum number of messages sent to the model per Think step.
    pub context_cap: usize,
    /// The job fails once this many recoverable errors happen in a row.
    pub retry_budget: u32,
    /// Hard cap on Think steps.
    pub max_iterations: u32,
    /// Timeout for a single shell or GUI capability call.
    pub tool_timeout: Duration,
    /// A code cell is complete once it has been silent this long.
    pub code_idle_timeout: Duration,
    /// Interpreter backing the stateful code session.
    pub python: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            context_cap: 20,
            retry_budget: 5,
            max_iterations: 100,
            tool_timeout: Duration::from_secs(120),
            code_idle_timeout: Duration::from_millis(2000),
            python: "python3".to_string(),
        }
    }
}

impl AgentConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let context_cap = parse_optional_env("AGENT_CONTEXT_CAP", defaults.context_cap)?;
        if context_cap < 3 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_CONTEXT_CAP".to_string(),
                message: "must be at least 3 (system prompt, task, latest message)".to_string(),
            });
        }

        let retry_budget = parse_optional_env("AGENT_RETRY_BUDGET", defaults.retry_budget)?;
        if retry_budget == 0 {
            return Err(ConfigError::InvalidValue {
                key: "AGENT_RETRY_BUDGET".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            context_cap,
            retry_budget,
            max_iterations: parse_optional_env("AGENT_MAX_ITERATIONS", defaults.max_iterations)?,
            tool_timeout: Duration::from_secs(parse_optional_env(
                "AGENT_TOOL_TIMEOUT_SECS",
                defaults.tool_timeout.as_secs(),
            )?),
            code_idle_timeout: Duration::from_millis(parse_optional_env(
                "AGENT_CODE_IDLE_MS",
                defaults.code_idle_timeout.as_millis() as u64,
            )?),
            python: optional_env("AGENT_PYTHON")?.unwrap_or(defaults.python),
        })
    }
}

pub(crate) fn optional_env(key: &str) -> Result<Option<String>, ConfigError> {
    match std::env::var(key) {
        Ok(val) if val.is_empty() => Ok(None),
        Ok(val) => Ok(Some(val)),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(ConfigError::ParseError(format!(
            "failed to read {key}: {e}"
        ))),
    }
}

pub(crate) fn parse_optional_env<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    optional_env(key)?
        .map(|s| {
            s.parse().map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{e}"),
            })
        })
        .transpose()
        .map(|opt| opt.unwrap_or(default))
}
