//! Stateful code execution backed by a long-lived Python interpreter.
//!
//! Variables, imports and definitions persist between calls for the life of
//! the session. The session is owned by the worker, started on first use and
//! torn down explicitly (and by `kill_on_drop` as a last resort).

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::tools::tool::{CapabilitySpec, MAX_OUTPUT_SIZE, ParamSpec, ToolError};
use crate::util::CappedOutput;

pub const EXECUTE_CODE: CapabilitySpec = CapabilitySpec {
    name: "execute_code",
    description: "Executes Python code in a persistent interpreter session. State is kept between calls; \
                  the value of a trailing expression is printed.",
    params: &[ParamSpec::required("code", "Python source to run")],
};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeArgs {
    pub code: String,
}

/// Printed by the driver after every cell, followed by the cell's sequence
/// number.
const CELL_DONE_MARKER: &str = "__AGENTBOX_CELL_DONE__";

/// Reads one JSON request per line and runs it in a shared namespace.
const DRIVER: &str = r#"
import ast, json, sys, traceback
sys.stderr = sys.stdout
ns = {"__name__": "__main__"}
for line in sys.stdin:
    seq = 0
    try:
        request = json.loads(line)
        seq = request["seq"]
        code = request["code"]
        tree = ast.parse(code, mode="exec")
        last = None
        if tree.body and isinstance(tree.body[-1], ast.Expr):
            last = ast.Expression(tree.body.pop().value)
        exec(compile(tree, "<cell>", "exec"), ns)
        if last is not None:
            value = eval(compile(last, "<cell>", "eval"), ns)
            if value is not None:
                print(repr(value))
    except BaseException:
        traceback.print_exc()
    print("__AGENTBOX_CELL_DONE__", seq, flush=True)
"#;

enum SessionOutput {
    Line(String),
    CellDone(u64),
}

struct RunningSession {
    child: Child,
    stdin: ChildStdin,
    output: mpsc::UnboundedReceiver<SessionOutput>,
    /// Sequence number of the last cell sent to the driver.
    sent: u64,
    /// Sequence number of the last cell the driver reported finished. Cells
    /// between `done` and `sent` were cut short by the idle rule and are
    /// still running.
    done: u64,
}

/// A lazily started interpreter process.
pub struct CodeSession {
    python: String,
    workspace: PathBuf,
    /// A cell is considered finished once it has been silent this long.
    idle: Duration,
    /// Upper bound on a single cell; the session is restarted past it.
    hard_timeout: Duration,
    running: Option<RunningSession>,
}

impl CodeSession {
    pub fn new(
        python: impl Into<String>,
        workspace: impl Into<PathBuf>,
        idle: Duration,
        hard_timeout: Duration,
    ) -> Self {
        Self {
            python: python.into(),
            workspace: workspace.into(),
            idle,
            hard_timeout,
            running: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Run one cell and return its combined output.
    pub async fn execute(&mut self, args: &CodeArgs) -> String {
        match self.run_cell(&args.code).await {
            Ok(output) if output.is_empty() => "(no output)".to_string(),
            Ok(output) => output,
            Err(e) => format!("Error executing code: {e}"),
        }
    }

    async fn run_cell(&mut self, code: &str) -> Result<String, ToolError> {
        if self.running.is_none() {
            self.running = Some(self.spawn()?);
        }
        let Some(session) = self.running.as_mut() else {
            return Err(ToolError::ExecutionFailed("session unavailable".to_string()));
        };

        // Output of earlier cells that were declared finished while still running.
        let mut late = CappedOutput::new(MAX_OUTPUT_SIZE);
        while let Ok(item) = session.output.try_recv() {
            match item {
                SessionOutput::Line(line) => late.push_str(&line),
                SessionOutput::CellDone(seq) => session.done = session.done.max(seq),
            }
        }

        let seq = session.sent + 1;
        let mut request = serde_json::to_string(&serde_json::json!({ "seq": seq, "code": code }))
            .map_err(|e| ToolError::InvalidParameters(e.to_string()))?;
        request.push('\n');
        if let Err(e) = write_request(&mut session.stdin, &request).await {
            self.restart_pending().await;
            return Err(ToolError::ExecutionFailed(format!(
                "interpreter is gone ({e}); a fresh session starts on the next call"
            )));
        }
        session.sent = seq;

        let mut output = CappedOutput::new(MAX_OUTPUT_SIZE);
        let deadline = Instant::now() + self.hard_timeout;
        let outcome = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break CellEnd::HardTimeout;
            }

            match tokio::time::timeout(self.idle.min(remaining), session.output.recv()).await {
                // Until the earlier cells report in, their output is not ours.
                Ok(Some(SessionOutput::Line(line))) if session.done + 1 < seq => {
                    late.push_str(&line)
                }
                Ok(Some(SessionOutput::Line(line))) => output.push_str(&line),
                Ok(Some(SessionOutput::CellDone(done))) => {
                    session.done = session.done.max(done);
                    if done >= seq {
                        break CellEnd::Done;
                    }
                }
                Ok(None) => break CellEnd::Exited,
                // Silent for the idle interval while this cell is running: done.
                Err(_) if remaining > self.idle && session.done + 1 >= seq => break CellEnd::Done,
                Err(_) => {}
            }
        };

        let mut result = String::new();
        if !late.is_empty() {
            result.push_str("[late output from an earlier call]\n");
            result.push_str(&late.into_string());
            result.push_str("[end of late output]\n");
        }
        result.push_str(&output.into_string());

        match outcome {
            CellEnd::Done => {}
            CellEnd::HardTimeout => {
                self.restart_pending().await;
                result.push_str(&format!(
                    "\n[execution exceeded {:?}; session restarted, state was lost]",
                    self.hard_timeout
                ));
            }
            CellEnd::Exited => {
                self.restart_pending().await;
                result.push_str("\n[interpreter exited; state was lost]");
            }
        }
        Ok(result)
    }

    fn spawn(&self) -> Result<RunningSession, ToolError> {
        let mut child = Command::new(&self.python)
            .args(["-u", "-c", DRIVER])
            .current_dir(&self.workspace)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ToolError::ExecutionFailed(format!("failed to start {}: {}", self.python, e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::ExecutionFailed("interpreter stdin unavailable".to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx));
        }

        tracing::debug!(python = %self.python, pid = ?child.id(), "Started code session");
        Ok(RunningSession {
            child,
            stdin,
            output: rx,
            sent: 0,
            done: 0,
        })
    }

    /// Kill the current interpreter so the next call starts a fresh one.
    async fn restart_pending(&mut self) {
        if let Some(mut session) = self.running.take() {
            let _ = session.child.kill().await;
        }
    }

    /// Stop the interpreter: close its input, give it a moment to exit, then
    /// kill it.
    pub async fn shutdown(&mut self) {
        let Some(session) = self.running.take() else {
            return;
        };
        let RunningSession {
            mut child, stdin, ..
        } = session;
        drop(stdin);
        if tokio::time::timeout(Duration::from_secs(1), child.wait())
            .await
            .is_err()
        {
            let _ = child.kill().await;
        }
        tracing::debug!("Code session shut down");
    }
}

async fn write_request(stdin: &mut ChildStdin, request: &str) -> std::io::Result<()> {
    stdin.write_all(request.as_bytes()).await?;
    stdin.flush().await
}

async fn forward_lines<R: AsyncRead + Unpin>(pipe: R, tx: mpsc::UnboundedSender<SessionOutput>) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let item = match parse_marker(&line) {
            Some(seq) => SessionOutput::CellDone(seq),
            None => SessionOutput::Line(format!("{line}\n")),
        };
        if tx.send(item).is_err() {
            break;
        }
    }
}

fn parse_marker(line: &str) -> Option<u64> {
    line.strip_prefix(CELL_DONE_MARKER)?.trim().parse().ok()
}

enum CellEnd {
    Done,
    HardTimeout,
    Exited,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }

    fn session(dir: &tempfile::TempDir) -> CodeSession {
        CodeSession::new(
            "python3",
            dir.path(),
            Duration::from_millis(500),
            Duration::from_secs(10),
        )
    }

    fn code(src: &str) -> CodeArgs {
        CodeArgs {
            code: src.to_string(),
        }
    }

    #[tokio::test]
    async fn test_state_persists_between_calls() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        assert!(!session.is_running());

        assert_eq!(session.execute(&code("x = 40")).await, "(no output)");
        assert!(session.is_running());
        assert_eq!(session.execute(&code("x + 2")).await, "42\n");
        assert_eq!(session.execute(&code("print('hi')\nx")).await, "hi\n40\n");

        session.shutdown().await;
        assert!(!session.is_running());
    }

    #[tokio::test]
    async fn test_exceptions_are_reported() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let out = session.execute(&code("1 / 0")).await;
        assert!(out.contains("ZeroDivisionError"), "got: {out}");
        // The session survives the exception.
        assert_eq!(session.execute(&code("'still here'")).await, "'still here'\n");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_cell_completes_after_idle() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let started = std::time::Instant::now();
        let out = session
            .execute(&code("import time\nprint('start', flush=True)\ntime.sleep(3)"))
            .await;
        assert_eq!(out, "start\n");
        assert!(started.elapsed() < Duration::from_secs(3));
        session.shutdown().await;
    }

    #[test]
    fn test_parse_marker() {
        assert_eq!(parse_marker("__AGENTBOX_CELL_DONE__ 7"), Some(7));
        assert_eq!(parse_marker("__AGENTBOX_CELL_DONE__"), None);
        assert_eq!(parse_marker("hello"), None);
    }

    #[tokio::test]
    async fn test_cell_after_idle_cutoff_gets_its_own_output() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session = CodeSession::new(
            "python3",
            dir.path(),
            Duration::from_millis(300),
            Duration::from_secs(10),
        );
        assert_eq!(
            session.execute(&code("import time\ntime.sleep(1.5)")).await,
            "(no output)"
        );
        assert_eq!(session.execute(&code("print('B')")).await, "B\n");
        assert_eq!(session.execute(&code("print('C')")).await, "C\n");
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_output_is_labelled() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session = CodeSession::new(
            "python3",
            dir.path(),
            Duration::from_millis(300),
            Duration::from_secs(10),
        );
        session
            .execute(&code("import time\ntime.sleep(1)\nprint('A', flush=True)"))
            .await;
        let out = session.execute(&code("print('B')")).await;
        assert_eq!(
            out,
            "[late output from an earlier call]\nA\n[end of late output]\nB\n"
        );
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_chatty_cell_output_is_capped() {
        if !python_available() {
            return;
        }
        let dir = tempfile::tempdir().unwrap();
        let mut session = session(&dir);
        let out = session
            .execute(&code("for _ in range(2000):\n    print('x' * 99)"))
            .await;
        let omitted = 2000 * 100 - MAX_OUTPUT_SIZE;
        assert!(
            out.ends_with(&format!("[output truncated, {omitted} bytes omitted]")),
            "got tail: {}",
            &out[out.len().saturating_sub(80)..]
        );
        assert!(out.len() < MAX_OUTPUT_SIZE + 100);
        session.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_an_observation() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = CodeSession::new(
            "/nonexistent/python",
            dir.path(),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );
        let out = session.execute(&code("1")).await;
        assert!(out.starts_with("Error executing code:"), "got: {out}");
        assert!(!session.is_running());
    }
}
