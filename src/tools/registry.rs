//! The closed set of capabilities and the dispatcher that runs them.
//!
//! Decoding a model turn happens in two steps: the raw text becomes a
//! [`ToolInvocation`] (name plus untyped arguments), which is then checked
//! against the named capability's argument struct to produce a [`Capability`].

use serde::Deserialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::tools::builtin::{
    self, CodeArgs, CodeSession, FinishArgs, GuiArgs, ListFilesArgs, ReadFileArgs, ShellArgs,
    WriteFileArgs, code, files, gui, shell,
};
use crate::tools::tool::{CapabilitySpec, ToolContext};

/// Every capability, in the order they are presented to the model.
pub const CAPABILITIES: &[CapabilitySpec] = &[
    files::LIST_FILES,
    files::READ_FILE,
    files::WRITE_FILE,
    shell::EXECUTE_SHELL,
    code::EXECUTE_CODE,
    gui::GUI_CONTROL,
    builtin::FINISH_TASK,
];

/// Look up a capability by name.
pub fn find_spec(name: &str) -> Option<&'static CapabilitySpec> {
    CAPABILITIES.iter().find(|spec| spec.name == name)
}

/// A model turn decoded as `{"tool_name": ..., "args": {...}}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

/// Why a model turn could not be turned into a capability call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("empty response")]
    Empty,

    #[error("invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Tool '{0}' not found.")]
    UnknownTool(String),

    #[error("invalid arguments for tool '{tool}': {reason}")]
    InvalidArguments { tool: String, reason: String },
}

impl ToolInvocation {
    /// Decode a raw model response. Markdown code fences around the object
    /// are tolerated.
    pub fn parse(raw: &str) -> Result<Self, InvocationError> {
        let trimmed = strip_code_fence(raw.trim());
        if trimmed.is_empty() {
            return Err(InvocationError::Empty);
        }
        serde_json::from_str(trimmed).map_err(|e| InvocationError::InvalidJson(e.to_string()))
    }
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Skip the info string ("json") up to the first newline.
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// A capability call with typed arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Capability {
    ListFiles(ListFilesArgs),
    ReadFile(ReadFileArgs),
    WriteFile(WriteFileArgs),
    ExecuteShell(ShellArgs),
    ExecuteCode(CodeArgs),
    GuiControl(GuiArgs),
    FinishTask(FinishArgs),
}

impl Capability {
    pub fn from_invocation(invocation: ToolInvocation) -> Result<Self, InvocationError> {
        let ToolInvocation { tool_name, args } = invocation;
        let args = serde_json::Value::Object(args);
        match tool_name.as_str() {
            "list_files" => typed(&tool_name, args).map(Capability::ListFiles),
            "read_file" => typed(&tool_name, args).map(Capability::ReadFile),
            "write_file" => typed(&tool_name, args).map(Capability::WriteFile),
            "execute_shell" => typed(&tool_name, args).map(Capability::ExecuteShell),
            "execute_code" => typed(&tool_name, args).map(Capability::ExecuteCode),
            "gui_control" => typed(&tool_name, args).map(Capability::GuiControl),
            "finish_task" => typed(&tool_name, args).map(Capability::FinishTask),
            _ => Err(InvocationError::UnknownTool(tool_name)),
        }
    }

    pub fn spec(&self) -> &'static CapabilitySpec {
        match self {
            Capability::ListFiles(_) => &files::LIST_FILES,
            Capability::ReadFile(_) => &files::READ_FILE,
            Capability::WriteFile(_) => &files::WRITE_FILE,
            Capability::ExecuteShell(_) => &shell::EXECUTE_SHELL,
            Capability::ExecuteCode(_) => &code::EXECUTE_CODE,
            Capability::GuiControl(_) => &gui::GUI_CONTROL,
            Capability::FinishTask(_) => &builtin::FINISH_TASK,
        }
    }

    pub fn name(&self) -> &'static str {
        self.spec().name
    }
}

fn typed<T: DeserializeOwned>(tool: &str, args: serde_json::Value) -> Result<T, InvocationError> {
    serde_json::from_value(args).map_err(|e| InvocationError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

/// Runs capabilities for one job. Owns the stateful code session.
pub struct CapabilityRegistry {
    ctx: ToolContext,
    code: CodeSession,
}

impl CapabilityRegistry {
    pub fn new(ctx: ToolContext, code: CodeSession) -> Self {
        Self { ctx, code }
    }

    pub fn context(&self) -> &ToolContext {
        &self.ctx
    }

    /// Run a capability and return its observation. Failures are reported in
    /// the text, never as an error.
    pub async fn execute(&mut self, capability: &Capability) -> String {
        tracing::debug!(tool = capability.name(), "Dispatching capability");
        match capability {
            Capability::ListFiles(args) => files::list_files(&self.ctx, args).await,
            Capability::ReadFile(args) => files::read_file(&self.ctx, args).await,
            Capability::WriteFile(args) => files::write_file(&self.ctx, args).await,
            Capability::ExecuteShell(args) => shell::execute_shell(&self.ctx, args).await,
            Capability::ExecuteCode(args) => self.code.execute(args).await,
            Capability::GuiControl(args) => gui::gui_control(&self.ctx, args).await,
            Capability::FinishTask(args) => args
                .summary
                .clone()
                .unwrap_or_else(|| "Task finished.".to_string()),
        }
    }

    /// Release backend resources. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        self.code.shutdown().await;
    }
}
