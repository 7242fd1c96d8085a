//! GUI automation on the sandbox's virtual display via `xdotool` and `scrot`.

use std::process::Stdio;

use serde::Deserialize;
use tokio::process::Command;

use crate::tools::builtin::shell::read_capped;
use crate::tools::tool::{CapabilitySpec, ParamSpec, ToolContext, ToolError};

pub const GUI_CONTROL: CapabilitySpec = CapabilitySpec {
    name: "gui_control",
    description: "Controls the desktop: move the mouse, click, type text, press keys or take a screenshot.",
    params: &[
        ParamSpec::required(
            "action",
            "one of mouse_move, click, double_click, type, key, screenshot",
        ),
        ParamSpec::optional("x", "screen x coordinate (mouse_move, click, double_click)"),
        ParamSpec::optional("y", "screen y coordinate (mouse_move, click, double_click)"),
        ParamSpec::optional("button", "left, middle or right (default left)"),
        ParamSpec::optional("text", "text to type (type)"),
        ParamSpec::optional("keys", "key combination such as ctrl+s or Return (key)"),
        ParamSpec::optional(
            "path",
            "where to save the screenshot (default screenshot.png)",
        ),
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuiAction {
    MouseMove,
    Click,
    DoubleClick,
    Type,
    Key,
    Screenshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Middle,
    Right,
}

impl MouseButton {
    fn xdotool_id(self) -> &'static str {
        match self {
            MouseButton::Left => "1",
            MouseButton::Middle => "2",
            MouseButton::Right => "3",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GuiArgs {
    pub action: GuiAction,
    #[serde(default)]
    pub x: Option<i32>,
    #[serde(default)]
    pub y: Option<i32>,
    #[serde(default)]
    pub button: Option<MouseButton>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub keys: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl GuiArgs {
    /// The program and argv that perform this action.
    fn command(&self, ctx: &ToolContext) -> Result<(&'static str, Vec<String>), ToolError> {
        let missing = |name: &str| {
            ToolError::InvalidParameters(format!("'{name}' is required for this action"))
        };
        let button = self.button.unwrap_or_default().xdotool_id().to_string();

        let mut argv: Vec<String> = Vec::new();
        let move_to = |argv: &mut Vec<String>| -> Result<(), ToolError> {
            match (self.x, self.y) {
                (Some(x), Some(y)) => {
                    argv.extend(["mousemove".to_string(), x.to_string(), y.to_string()]);
                    Ok(())
                }
                (None, None) => Ok(()),
                _ => Err(ToolError::InvalidParameters(
                    "'x' and 'y' must be given together".to_string(),
                )),
            }
        };

        match self.action {
            GuiAction::MouseMove => {
                if self.x.is_none() {
                    return Err(missing("x"));
                }
                move_to(&mut argv)?;
            }
            GuiAction::Click => {
                move_to(&mut argv)?;
                argv.extend(["click".to_string(), button]);
            }
            GuiAction::DoubleClick => {
                move_to(&mut argv)?;
                argv.extend([
                    "click".to_string(),
                    "--repeat".to_string(),
                    "2".to_string(),
                    button,
                ]);
            }
            GuiAction::Type => {
                let text = self.text.as_ref().ok_or_else(|| missing("text"))?;
                argv.extend([
                    "type".to_string(),
                    "--delay".to_string(),
                    "20".to_string(),
                    "--".to_string(),
                    text.clone(),
                ]);
            }
            GuiAction::Key => {
                let keys = self.keys.as_ref().ok_or_else(|| missing("keys"))?;
                argv.extend(["key".to_string(), "--".to_string(), keys.clone()]);
            }
            GuiAction::Screenshot => {
                let path = ctx.resolve(self.path.as_deref().unwrap_or("screenshot.png"));
                return Ok(("scrot", vec!["-o".to_string(), path.display().to_string()]));
            }
        }
        Ok(("xdotool", argv))
    }
}

pub async fn gui_control(ctx: &ToolContext, args: &GuiArgs) -> String {
    match run(ctx, args).await {
        Ok(message) => message,
        Err(e) => format!("Error performing GUI action: {e}"),
    }
}

async fn run(ctx: &ToolContext, args: &GuiArgs) -> Result<String, ToolError> {
    let (program, argv) = args.command(ctx)?;
    let mut child = Command::new(program)
        .args(&argv)
        .current_dir(&ctx.workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to run {program}: {e}")))?;

    let stderr = child.stderr.take();
    let stdout = child.stdout.take();
    let (status, stderr, _) = tokio::time::timeout(ctx.timeout, async {
        tokio::join!(child.wait(), read_capped(stderr), read_capped(stdout))
    })
    .await
    .map_err(|_| ToolError::Timeout(ctx.timeout))?;

    let status = status?;
    if !status.success() {
        return Err(ToolError::ExecutionFailed(format!(
            "{program} exited with {status}: {}",
            stderr.trim()
        )));
    }

    Ok(match args.action {
        GuiAction::Screenshot => format!(
            "Screenshot saved to {}.",
            args.path.as_deref().unwrap_or("screenshot.png")
        ),
        action => format!("GUI action {action:?} performed."),
    })
}
