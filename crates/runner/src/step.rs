//! Runs one step as a shell subprocess.

use std::collections::BTreeMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use engine::{AssignedStep, LogIngest, LogLevel, StepAction, StepStatus};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{RunnerError, SchedulerClient};

/// How long to keep reading output once the shell is gone.  Background
/// children may still hold the pipes open.
const DRAIN_AFTER_EXIT: Duration = Duration::from_secs(1);

/// What happened to a step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub status: StepStatus,
    /// `None` when the process never exited on its own.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub output: String,
    /// Why the step failed, if it did, followed by the captured stderr.
    pub error: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

enum Exit {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut(Duration),
}

/// Executes steps with `sh -c`, streaming every output line to the
/// scheduler as it is produced.
#[derive(Clone)]
pub struct StepExecutor {
    client: Arc<dyn SchedulerClient>,
}

impl StepExecutor {
    pub fn new(client: Arc<dyn SchedulerClient>) -> Self {
        Self { client }
    }

    /// Run `step` with `job_env` underneath the step's own variables.
    ///
    /// The process is killed at the step's timeout or at `deadline`,
    /// whichever comes first, and as soon as `cancel` fires.  Never fails:
    /// every problem ends up in the outcome.
    #[instrument(skip_all, fields(step = %step.name, step_id = %step.step_id))]
    pub async fn execute(
        &self,
        step: &AssignedStep,
        job_env: &BTreeMap<String, String>,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let started_at = Utc::now();
        let begun = Instant::now();
        let command = match &step.action {
            StepAction::Shell { command } => command,
        };

        let mut env = job_env.clone();
        env.extend(step.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &step.working_directory {
            cmd.current_dir(dir);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                let e = RunnerError::Spawn {
                    command: command.clone(),
                    source,
                };
                warn!(error = %e, "step could not start");
                return StepOutcome {
                    status: StepStatus::Failed,
                    exit_code: None,
                    output: String::new(),
                    error: e.to_string(),
                    started_at,
                    finished_at: Utc::now(),
                };
            }
        };

        let stdout = child
            .stdout
            .take()
            .map(|out| self.forward(out, step.step_id, LogLevel::Info));
        let stderr = child
            .stderr
            .take()
            .map(|err| self.forward(err, step.step_id, LogLevel::Error));

        // A limit too far out to represent is no limit.
        let limit = match (step.timeout.and_then(|t| begun.checked_add(t)), deadline) {
            (Some(own), Some(job)) => Some(own.min(job)),
            (own, job) => own.or(job),
        };
        let expiry = async move {
            match limit {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        let exit = tokio::select! {
            status = child.wait() => Exit::Exited(status),
            _ = cancel.cancelled() => Exit::Cancelled,
            _ = expiry => Exit::TimedOut(begun.elapsed()),
        };
        if !matches!(exit, Exit::Exited(_)) {
            if let Err(e) = child.kill().await {
                warn!(error = %e, "could not kill step process");
            }
        }

        let output = drain(stdout).await;
        let stderr = drain(stderr).await;

        let (status, exit_code, failure) = match exit {
            Exit::Exited(Ok(status)) => match status.code() {
                Some(0) => (StepStatus::Success, Some(0), None),
                Some(code) => (
                    StepStatus::Failed,
                    Some(code),
                    Some(RunnerError::Execution { code }),
                ),
                None => (StepStatus::Failed, None, Some(RunnerError::Terminated)),
            },
            Exit::Exited(Err(e)) => (StepStatus::Failed, None, Some(RunnerError::Io(e))),
            Exit::Cancelled => (StepStatus::Cancelled, None, Some(RunnerError::Cancelled)),
            Exit::TimedOut(after) => (StepStatus::Failed, None, Some(RunnerError::Timeout(after))),
        };
        debug!(%status, ?exit_code, "step finished");

        let error = match failure {
            Some(reason) if stderr.is_empty() => reason.to_string(),
            Some(reason) => format!("{reason}\n{stderr}"),
            None => stderr,
        };
        StepOutcome {
            status,
            exit_code,
            output,
            error,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Ship each line of `reader` as a log entry; the task returns
    /// everything it read.
    fn forward<R>(&self, reader: R, step_id: Uuid, level: LogLevel) -> JoinHandle<String>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let client = Arc::clone(&self.client);
        tokio::spawn(async move {
            let mut captured = String::new();
            let mut reader = BufReader::new(reader);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        // Output is not required to be UTF-8.
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches('\n').trim_end_matches('\r');
                        let ingest = LogIngest {
                            step_id,
                            level,
                            content: line.to_owned(),
                        };
                        if let Err(e) = client.append_log(ingest).await {
                            warn!(%step_id, error = %e, "could not ship log line");
                        }
                        captured.push_str(line);
                        captured.push('\n');
                    }
                    Err(e) => {
                        warn!(%step_id, error = %e, "stopped reading step output");
                        break;
                    }
                }
            }
            captured
        })
    }
}

async fn drain(reader: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = reader else {
        return String::new();
    };
    match tokio::time::timeout(DRAIN_AFTER_EXIT, &mut handle).await {
        Ok(joined) => joined.unwrap_or_default(),
        Err(_) => {
            handle.abort();
            String::new()
        }
    }
}

// ============================================================
// Unit tests
// ============================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::RecordingClient;

    fn step(command: &str) -> AssignedStep {
        AssignedStep {
            step_id: Uuid::new_v4(),
            name: "test step".into(),
            action: StepAction::Shell {
                command: command.into(),
            },
            env: BTreeMap::new(),
            working_directory: None,
            continue_on_error: false,
            timeout: None,
        }
    }

    fn executor() -> (Arc<RecordingClient>, StepExecutor) {
        let client = Arc::new(RecordingClient::new());
        (client.clone(), StepExecutor::new(client))
    }

    async fn run(executor: &StepExecutor, step: &AssignedStep) -> StepOutcome {
        executor
            .execute(step, &BTreeMap::new(), None, &CancellationToken::new())
            .await
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr_separately() {
        let (client, executor) = executor();
        let outcome = run(&executor, &step("echo out; echo err >&2")).await;

        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output, "out\n");
        assert_eq!(outcome.error, "err\n");
        assert!(outcome.started_at <= outcome.finished_at);

        let mut shipped: Vec<(LogLevel, String)> = client
            .logs()
            .into_iter()
            .map(|l| (l.level, l.content))
            .collect();
        shipped.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            shipped,
            vec![
                (LogLevel::Error, "err".to_string()),
                (LogLevel::Info, "out".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn step_env_overrides_job_env() {
        let (_, executor) = executor();
        let mut step = step("echo \"$A $B\"");
        step.env.insert("A".into(), "step".into());
        let job_env = BTreeMap::from([
            ("A".to_string(), "job".to_string()),
            ("B".to_string(), "job".to_string()),
        ]);

        let outcome = executor
            .execute(&step, &job_env, None, &CancellationToken::new())
            .await;
        assert_eq!(outcome.output, "step job\n");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_step() {
        let (_, executor) = executor();
        let outcome = run(&executor, &step("echo nope >&2; exit 3")).await;

        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.error, "command exited with code 3\nnope\n");
    }

    #[tokio::test]
    async fn runs_in_the_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "found it").unwrap();

        let (_, executor) = executor();
        let mut step = step("cat marker.txt");
        step.working_directory = Some(dir.path().display().to_string());

        let outcome = run(&executor, &step).await;
        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.output, "found it\n");
    }

    #[tokio::test]
    async fn missing_working_directory_is_a_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (_, executor) = executor();
        let mut step = step("true");
        step.working_directory = Some(dir.path().join("absent").display().to_string());

        let outcome = run(&executor, &step).await;
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.error.starts_with("failed to start `true`"));
    }

    #[tokio::test]
    async fn step_timeout_kills_the_process() {
        let (_, executor) = executor();
        let mut step = step("sleep 30");
        step.timeout = Some(Duration::from_millis(100));

        let begun = std::time::Instant::now();
        let outcome = run(&executor, &step).await;
        assert!(begun.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.status, StepStatus::Failed);
        assert_eq!(outcome.exit_code, None);
        assert!(outcome.error.starts_with("timed out after"));
    }

    #[tokio::test]
    async fn unrepresentable_timeout_means_no_limit() {
        let (_, executor) = executor();
        let mut step = step("true");
        step.timeout = Some(Duration::from_secs(u64::MAX / 2));

        let outcome = run(&executor, &step).await;
        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_kept_lossily() {
        let (client, executor) = executor();
        let outcome = run(&executor, &step("printf 'ok\\n\\377\\n'; sleep 0.2; echo after")).await;

        assert_eq!(outcome.status, StepStatus::Success);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output, "ok\n\u{FFFD}\nafter\n");
        let shipped: Vec<String> = client.logs().into_iter().map(|l| l.content).collect();
        assert_eq!(shipped, vec!["ok", "\u{FFFD}", "after"]);
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let (_, executor) = executor();
        let step = step("sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = executor
            .execute(&step, &BTreeMap::new(), None, &cancel)
            .await;
        assert_eq!(outcome.status, StepStatus::Cancelled);
        assert_eq!(outcome.error, "cancelled");
    }
}
