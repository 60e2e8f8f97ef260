//! Subprocess-backed [`TaskExecutor`].
//!
//! [`ProcessExecutor`] runs the agent CLI once per task in print mode with
//! JSON output, enforces a deadline (SIGTERM, grace period, SIGKILL) and maps
//! the final JSON result object onto a [`TaskResult`].

use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::executor::{Task, TaskExecutor, TaskResult};

/// Default per-invocation timeout (10 minutes).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Grace period after SIGTERM before SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Runs each task as a separate agent CLI process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    bin: PathBuf,
    timeout: Duration,
}

impl ProcessExecutor {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Default deadline for tasks that do not carry their own. Zero keeps the default.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.timeout = timeout;
        }
        self
    }

    fn build_command(&self, task: &Task) -> Command {
        let working_dir = task
            .workdir()
            .filter(|d| d.exists())
            .map(PathBuf::from)
            .or_else(dirs::home_dir)
            .unwrap_or_else(std::env::temp_dir);

        let mut cmd = Command::new(&self.bin);
        cmd.current_dir(&working_dir)
            .arg("-p")
            .arg(task.prompt())
            .arg("--output-format")
            .arg("json")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if !task.agent().is_empty() {
            cmd.arg("--agent").arg(task.agent());
        }
        if let Some(model) = task.model() {
            cmd.arg("--model").arg(model);
        }
        if let Some(budget) = task.budget() {
            cmd.arg("--max-budget-usd").arg(format!("{budget:.2}"));
        }
        if let Some(session) = task.session_id() {
            cmd.arg("--resume").arg(session);
        }
        cmd
    }
}

#[async_trait]
impl TaskExecutor for ProcessExecutor {
    async fn execute(&self, task: &Task, cancel: &CancellationToken) -> TaskResult {
        let started = Instant::now();
        let timeout = task.timeout().unwrap_or(self.timeout);

        info!(
            task_id = %task.id(),
            task_name = %task.name(),
            depth = task.depth(),
            bin = %self.bin.display(),
            "Spawning agent process"
        );

        let mut child = match self.build_command(task).spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!(task_id = %task.id(), error = %e, "Failed to spawn agent process");
                let error = format!("failed to spawn {}: {e}", self.bin.display());
                return TaskResult::failure(error, -1).with_duration_ms(elapsed_ms(started));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let stdout_task = tokio::spawn(read_all(stdout));
        let stderr_task = tokio::spawn(read_all(stderr));

        let outcome = tokio::select! {
            status = tokio::time::timeout(timeout, child.wait()) => match status {
                Ok(Ok(status)) => Exit::Code(status.code().unwrap_or(-1)),
                Ok(Err(e)) => Exit::WaitError(e.to_string()),
                Err(_) => Exit::TimedOut,
            },
            () = cancel.cancelled() => Exit::Cancelled,
        };

        if matches!(outcome, Exit::TimedOut | Exit::Cancelled) {
            warn!(task_id = %task.id(), ?timeout, "Stopping agent process");
            terminate_process(&mut child).await;
        }

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let duration_ms = elapsed_ms(started);

        let mut result = match outcome {
            Exit::Code(code) => parse_result(&stdout, &stderr, code),
            Exit::WaitError(e) => TaskResult::failure(format!("process error: {e}"), -1),
            Exit::TimedOut => TaskResult {
                status: "timeout".to_string(),
                error: format!(
                    "timed out after {}",
                    taskweave_core::duration::format_duration(timeout)
                ),
                output: stdout,
                exit_code: -1,
                ..TaskResult::default()
            },
            Exit::Cancelled => TaskResult {
                status: "cancelled".to_string(),
                error: "cancelled".to_string(),
                output: stdout,
                exit_code: -1,
                ..TaskResult::default()
            },
        };
        result.duration_ms = duration_ms;

        debug!(
            task_id = %task.id(),
            status = %result.status,
            exit_code = result.exit_code,
            duration_ms,
            "Agent process finished"
        );
        result
    }
}

enum Exit {
    Code(i32),
    WaitError(String),
    TimedOut,
    Cancelled,
}

/// Read a pipe to the end. Invalid UTF-8 is replaced rather than dropping
/// the whole stream.
async fn read_all<R: tokio::io::AsyncRead + Unpin>(reader: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut reader) = reader {
        if let Err(e) = reader.read_to_end(&mut buf).await {
            warn!(error = %e, read = buf.len(), "Failed to read agent output");
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Final result object printed by the agent CLI in JSON output mode.
#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(default)]
    result: String,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    total_cost_usd: f64,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    usage: CliUsage,
}

#[derive(Debug, Default, Deserialize)]
struct CliUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Map process output onto a [`TaskResult`].
///
/// The last stdout line that parses as a result object wins; without one the
/// raw stdout becomes the output and the exit code decides success.
fn parse_result(stdout: &str, stderr: &str, exit_code: i32) -> TaskResult {
    let parsed = stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .find_map(|l| serde_json::from_str::<CliResult>(l).ok())
        .or_else(|| serde_json::from_str::<CliResult>(stdout.trim()).ok());

    match parsed {
        Some(cli) => {
            let failed = cli.is_error || exit_code != 0;
            TaskResult {
                status: if failed { "error" } else { "success" }.to_string(),
                error: if failed {
                    let text = if cli.is_error { cli.result.trim() } else { stderr.trim() };
                    if text.is_empty() {
                        format!("agent reported an error (exit code {exit_code})")
                    } else {
                        text.to_string()
                    }
                } else {
                    String::new()
                },
                output: cli.result,
                cost: cli.total_cost_usd,
                tokens_in: cli.usage.input_tokens,
                tokens_out: cli.usage.output_tokens,
                session_id: cli.session_id,
                exit_code,
                ..TaskResult::default()
            }
        }
        None if exit_code == 0 => TaskResult {
            status: "success".to_string(),
            output: stdout.trim().to_string(),
            ..TaskResult::default()
        },
        None => TaskResult {
            status: "error".to_string(),
            output: stdout.trim().to_string(),
            error: stderr.trim().to_string(),
            exit_code,
            ..TaskResult::default()
        },
    }
}

/// Terminate a process: SIGTERM, wait grace period, then SIGKILL.
async fn terminate_process(child: &mut tokio::process::Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id() {
            #[allow(unsafe_code, clippy::cast_possible_wrap)]
            let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            if ret != 0 {
                let err = std::io::Error::last_os_error();
                warn!(pid, error = %err, "Failed to send SIGTERM");
            }
        }
    }

    if tokio::time::timeout(GRACE_PERIOD, child.wait()).await.is_err() {
        warn!("Grace period expired, sending SIGKILL");
        let _ = child.kill().await;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_json_result() {
        let stdout = r#"{"type":"result","result":"All done","is_error":false,"total_cost_usd":0.0123,"session_id":"s-1","usage":{"input_tokens":10,"output_tokens":20}}"#;
        let result = parse_result(stdout, "", 0);
        assert!(result.is_success());
        assert_eq!(result.output, "All done");
        assert!((result.cost - 0.0123).abs() < f64::EPSILON);
        assert_eq!(result.session_id.as_deref(), Some("s-1"));
        assert_eq!(result.tokens_in, 10);
        assert_eq!(result.tokens_out, 20);
    }

    #[test]
    fn is_error_flag_fails_result() {
        let stdout = r#"{"result":"budget exceeded","is_error":true}"#;
        let result = parse_result(stdout, "", 0);
        assert!(!result.is_success());
        assert_eq!(result.error, "budget exceeded");
    }

    #[test]
    fn is_error_without_text_still_fails() {
        let result = parse_result(r#"{"result":"","is_error":true}"#, "", 0);
        assert!(!result.is_success());
        assert!(result.error.contains("agent reported an error"));
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_kept() {
        let bytes: &[u8] = b"useful result \xff tail";
        let output = read_all(Some(bytes)).await;
        assert!(output.starts_with("useful result "));
        assert!(output.ends_with(" tail"));
        assert!(output.contains('\u{FFFD}'));

        let result = parse_result(&output, "", 0);
        assert!(result.is_success());
        assert!(result.output.contains("useful result"));
    }

    #[test]
    fn picks_last_json_line() {
        let stdout = "warming up\n{\"result\":\"first\"}\nnoise\n{\"result\":\"second\"}\n";
        let result = parse_result(stdout, "", 0);
        assert_eq!(result.output, "second");
    }

    #[test]
    fn plain_output_uses_exit_code() {
        let ok = parse_result("hello\n", "", 0);
        assert!(ok.is_success());
        assert_eq!(ok.output, "hello");

        let failed = parse_result("partial", "boom\n", 3);
        assert!(!failed.is_success());
        assert_eq!(failed.exit_code, 3);
        assert_eq!(failed.error, "boom");
    }

    #[test]
    fn nonzero_exit_with_json_fails_with_stderr() {
        let result = parse_result(r#"{"result":"half"}"#, "crashed", 1);
        assert!(!result.is_success());
        assert_eq!(result.error, "crashed");
        assert_eq!(result.output, "half");
    }

    #[tokio::test]
    async fn missing_binary_reports_failure() {
        let executor = ProcessExecutor::new("/nonexistent/taskweave-agent-bin");
        let result = executor
            .execute(&Task::new("hi"), &CancellationToken::new())
            .await;
        assert!(!result.is_success());
        assert!(result.error.contains("failed to spawn"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_process_and_captures_stdout() {
        // `echo` ignores the generated flags and prints them back.
        let executor = ProcessExecutor::new("echo");
        let result = executor
            .execute(&Task::new("hello"), &CancellationToken::new())
            .await;
        assert!(result.is_success(), "{result:?}");
        assert!(result.output.contains("hello"));
    }

    #[cfg(unix)]
    fn sleeping_script(dir: &std::path::Path) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("agent.sh");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 5\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_terminates_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let executor = ProcessExecutor::new(sleeping_script(dir.path()));
        let task = Task::new("ignored").with_timeout(Some(Duration::from_millis(100)));

        let started = Instant::now();
        let result = executor.execute(&task, &CancellationToken::new()).await;
        assert_eq!(result.status, "timeout");
        assert!(!result.is_success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_stops_process() {
        let dir = tempfile::TempDir::new().unwrap();
        let executor = ProcessExecutor::new(sleeping_script(dir.path()));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = executor.execute(&Task::new("ignored"), &cancel).await;
        assert_eq!(result.status, "cancelled");
    }
}
