//! Shell command execution inside the workspace.

use std::process::Stdio;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use crate::tools::tool::{CapabilitySpec, MAX_OUTPUT_SIZE, ParamSpec, ToolContext, ToolError};
use crate::util::CappedOutput;

pub const EXECUTE_SHELL: CapabilitySpec = CapabilitySpec {
    name: "execute_shell",
    description: "Executes a shell command in the workspace and returns its stdout and stderr.",
    params: &[ParamSpec::required("command", "command line passed to `sh -c`")],
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShellArgs {
    pub command: String,
}

struct CommandOutput {
    stdout: String,
    stderr: String,
    exit_code: Option<i32>,
}

pub async fn execute_shell(ctx: &ToolContext, args: &ShellArgs) -> String {
    tracing::debug!(command = %args.command, "Running shell command");
    match run(ctx, &args.command).await {
        Ok(out) if out.exit_code == Some(0) => format!(
            "STDOUT:\n{}\nSTDERR:\n{}",
            out.stdout,
            out.stderr
        ),
        Ok(out) => {
            let status = match out.exit_code {
                Some(code) => format!("non-zero exit status {code}"),
                None => "termination by signal".to_string(),
            };
            format!(
                "Error executing command: Command '{}' returned {}.\nSTDOUT:\n{}\nSTDERR:\n{}",
                args.command,
                status,
                out.stdout,
                out.stderr
            )
        }
        Err(e) => format!("Error executing command: {e}"),
    }
}

async fn run(ctx: &ToolContext, command: &str) -> Result<CommandOutput, ToolError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(&ctx.workspace)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolError::ExecutionFailed(format!("failed to spawn sh: {e}")))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let result = tokio::time::timeout(ctx.timeout, async {
        let (stdout, stderr, status) =
            tokio::join!(read_capped(stdout), read_capped(stderr), child.wait());
        Ok::<_, std::io::Error>(CommandOutput {
            stdout,
            stderr,
            exit_code: status?.code(),
        })
    })
    .await;

    match result {
        Ok(output) => Ok(output?),
        Err(_) => {
            let _ = child.kill().await;
            Err(ToolError::Timeout(ctx.timeout))
        }
    }
}

/// Read a pipe to the end, keeping at most `MAX_OUTPUT_SIZE` bytes. The
/// rest is drained and counted in the truncation notice.
pub(crate) async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let Some(mut pipe) = pipe else {
        return String::new();
    };
    let mut buf = Vec::new();
    (&mut pipe)
        .take(MAX_OUTPUT_SIZE as u64)
        .read_to_end(&mut buf)
        .await
        .ok();
    let drained = tokio::io::copy(&mut pipe, &mut tokio::io::sink())
        .await
        .unwrap_or(0);

    let mut out = CappedOutput::new(MAX_OUTPUT_SIZE);
    out.push_str(&String::from_utf8_lossy(&buf));
    out.add_omitted(drained);
    out.into_string()
}
