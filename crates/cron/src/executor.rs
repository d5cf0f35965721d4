//! The external cron daemon, reached through its command-line interface.

use std::{
    process::Stdio,
    sync::Arc,
    time::{Duration, Instant},
};

use {
    async_trait::async_trait,
    tokio::process::Command,
    tracing::{debug, warn},
};

use deckhand_config::ExecutorConfig;

use crate::{
    Error, Result,
    types::{ExecutorJob, QueueKind, parse_job_list, tail_chars},
};

/// Characters of stderr carried in a [`Error::CommandFailed`].
const ERROR_STDERR_TAIL: usize = 500;

/// Captured output of one executor invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs one executor subcommand with a hard timeout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run the executor with `args`. A timeout kills the child and returns
    /// [`Error::Timeout`]; a non-zero exit is *not* an error here.
    async fn run(&self, args: &[String], timeout: Duration) -> Result<CommandOutput>;
}

/// Spawns the executor binary as a child process.
#[derive(Debug, Clone)]
pub struct CliRunner {
    binary: String,
    base_args: Vec<String>,
}

impl CliRunner {
    pub fn new(binary: impl Into<String>, base_args: Vec<String>) -> Self {
        Self {
            binary: binary.into(),
            base_args,
        }
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.binary.clone(), config.base_args.clone())
    }

    fn describe(&self, args: &[String]) -> String {
        std::iter::once(self.binary.as_str())
            .chain(self.base_args.iter().map(String::as_str))
            .chain(args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl CommandRunner for CliRunner {
    async fn run(&self, args: &[String], timeout: Duration) -> Result<CommandOutput> {
        let command = self.describe(args);
        debug!(command, timeout_secs = timeout.as_secs(), "running executor");

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.base_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let started = Instant::now();
        let child = cmd.spawn().map_err(|source| Error::Spawn {
            command: command.clone(),
            source,
        })?;

        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let out = CommandOutput {
                    exit_code: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    duration: started.elapsed(),
                };
                debug!(
                    command,
                    exit_code = ?out.exit_code,
                    stdout_len = out.stdout.len(),
                    stderr_len = out.stderr.len(),
                    "executor done"
                );
                Ok(out)
            },
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => {
                // Dropping the `wait_with_output` future drops the child,
                // which kills it.
                warn!(command, timeout_secs = timeout.as_secs(), "executor timed out");
                Err(Error::Timeout { command, timeout })
            },
        }
    }
}

/// Per-subcommand hard timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutorTimeouts {
    pub list: Duration,
    pub run: Duration,
    pub delete: Duration,
}

impl Default for ExecutorTimeouts {
    fn default() -> Self {
        Self {
            list: Duration::from_secs(20),
            run: Duration::from_secs(10 * 60),
            delete: Duration::from_secs(60),
        }
    }
}

impl ExecutorTimeouts {
    pub fn from_config(config: &ExecutorConfig) -> Result<Self> {
        Ok(Self {
            list: config.list_timeout()?,
            run: config.run_timeout()?,
            delete: config.delete_timeout()?,
        })
    }

    /// Hard limit of the subcommand that executes `queue` requests.
    #[must_use]
    pub fn for_queue(&self, queue: QueueKind) -> Duration {
        match queue {
            QueueKind::Run => self.run,
            QueueKind::Delete => self.delete,
        }
    }
}

/// Typed access to the executor's `cron` subcommands.
#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
    timeouts: ExecutorTimeouts,
}

impl Executor {
    pub fn new(runner: Arc<dyn CommandRunner>, timeouts: ExecutorTimeouts) -> Self {
        Self { runner, timeouts }
    }

    #[must_use]
    pub fn timeouts(&self) -> ExecutorTimeouts {
        self.timeouts
    }

    /// `cron list --all --json`, validated. Any failure rejects the listing.
    pub async fn list_jobs(&self) -> Result<Vec<ExecutorJob>> {
        let args = args(&["cron", "list", "--all", "--json"]);
        let output = self.runner.run(&args, self.timeouts.list).await?;
        if !output.success() {
            return Err(Error::CommandFailed {
                command: args.join(" "),
                exit_code: output.exit_code,
                stderr_tail: tail_chars(output.stderr.trim_end(), ERROR_STDERR_TAIL),
            });
        }
        Ok(parse_job_list(&output.stdout)?)
    }

    /// `cron run <id> --force`.
    pub async fn run_job(&self, job_id: &str) -> Result<CommandOutput> {
        let args = args(&["cron", "run", job_id, "--force"]);
        self.runner.run(&args, self.timeouts.run).await
    }

    /// `cron rm <id>`.
    pub async fn remove_job(&self, job_id: &str) -> Result<CommandOutput> {
        let args = args(&["cron", "rm", job_id]);
        self.runner.run(&args, self.timeouts.delete).await
    }

    /// The subcommand a queue's requests translate to.
    pub async fn execute(&self, queue: QueueKind, job_id: &str) -> Result<CommandOutput> {
        match queue {
            QueueKind::Run => self.run_job(job_id).await,
            QueueKind::Delete => self.remove_job(job_id).await,
        }
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| (*s).to_string()).collect()
}


#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use {
        super::{
            testing::{Reply, ScriptedRunner},
            *,
        },
        crate::ExecutorOutputError,
    };

    fn executor(runner: Arc<ScriptedRunner>) -> Executor {
        Executor::new(runner, ExecutorTimeouts::default())
    }

    fn sh(script: &str) -> CliRunner {
        CliRunner::new("sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn list_jobs_parses_listing() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply(
            "cron list",
            Reply::ok(r#"{"jobs":[{"id":"j1","enabled":true,"schedule":{"kind":"cron","expr":"0 * * * *"}}]}"#),
        );
        let jobs = executor(Arc::clone(&runner)).list_jobs().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(runner.calls(), vec!["cron list --all --json"]);
    }

    #[tokio::test]
    async fn list_jobs_nonzero_exit_is_command_failed() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply("cron list", Reply::fail(2, "gateway unreachable\n"));
        let err = executor(runner).list_jobs().await.unwrap_err();
        match err {
            Error::CommandFailed {
                exit_code,
                stderr_tail,
                ..
            } => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr_tail, "gateway unreachable");
            },
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn list_jobs_rejects_invalid_output() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.reply("cron list", Reply::ok("not json"));
        let err = executor(runner).list_jobs().await.unwrap_err();
        assert!(matches!(
            err,
            Error::ExecutorOutput(ExecutorOutputError::NotJson(_))
        ));
        assert!(err.is_executor_failure());
    }

    #[tokio::test]
    async fn execute_maps_queue_to_subcommand() {
        let runner = Arc::new(ScriptedRunner::new());
        let exec = executor(Arc::clone(&runner));
        exec.execute(QueueKind::Run, "j1").await.unwrap();
        exec.execute(QueueKind::Delete, "j2").await.unwrap();
        assert_eq!(runner.calls(), vec!["cron run j1 --force", "cron rm j2"]);
    }

    #[test]
    fn timeouts_from_config() {
        let config = ExecutorConfig {
            run_timeout: "90s".into(),
            ..Default::default()
        };
        let timeouts = ExecutorTimeouts::from_config(&config).unwrap();
        assert_eq!(timeouts.run, Duration::from_secs(90));
        assert_eq!(timeouts.list, Duration::from_secs(20));
        assert_eq!(timeouts.delete, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn cli_runner_passes_args_and_captures_output() {
        let runner = sh(r#"echo "$0 $1"; echo oops >&2; exit 3"#);
        let out = runner
            .run(&args(&["cron", "list"]), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "cron list");
        assert_eq!(out.stderr.trim(), "oops");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn cli_runner_kills_on_timeout() {
        let runner = sh("sleep 5");
        let started = Instant::now();
        let err = runner
            .run(&args(&["cron", "list"]), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn cli_runner_missing_binary_is_spawn_error() {
        let runner = CliRunner::new("/nonexistent/deckhand-executor", Vec::new());
        let err = runner
            .run(&args(&["cron", "list"]), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Spawn { .. }));
    }
}
