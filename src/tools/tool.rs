//! Capability metadata and the execution context shared by all capabilities.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Largest observation handed back to the model, in bytes.
pub const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// One named argument of a capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
}

impl ParamSpec {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: true,
        }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: false,
        }
    }
}

/// Static description of a capability, declared next to its implementation.
///
/// The system prompt is rendered from these, and the argument structs are
/// tested against them, so the two cannot disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilitySpec {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
}

impl CapabilitySpec {
    pub fn param_names(&self) -> Vec<&'static str> {
        self.params.iter().map(|p| p.name).collect()
    }
}

/// Why a capability could not produce its normal output.
///
/// Never surfaces past the registry: it is rendered into the observation.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where and how capabilities run.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Workspace root; relative paths resolve against it.
    pub workspace: PathBuf,
    /// Timeout for one shell or GUI invocation.
    pub timeout: Duration,
}

impl ToolContext {
    pub fn new(workspace: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            workspace: workspace.into(),
            timeout,
        }
    }

    /// Resolve a model-supplied path. Absolute paths are taken as given.
    pub fn resolve(&self, path: &str) -> PathBuf {
        let path = Path::new(path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.workspace.join(path)
        }
    }
}
