//! Built-in capabilities available inside the sandbox.

pub mod code;
pub mod files;
pub mod gui;
pub mod shell;

use serde::Deserialize;

use crate::tools::tool::{CapabilitySpec, ParamSpec};

pub use code::{CodeArgs, CodeSession};
pub use files::{ListFilesArgs, ReadFileArgs, WriteFileArgs};
pub use gui::GuiArgs;
pub use shell::ShellArgs;

pub const FINISH_TASK: CapabilitySpec = CapabilitySpec {
    name: "finish_task",
    description: "Signals that the task is finished. Call it once the task is complete.",
    params: &[ParamSpec::optional(
        "summary",
        "short description of what was done",
    )],
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinishArgs {
    #[serde(default)]
    pub summary: Option<String>,
}
