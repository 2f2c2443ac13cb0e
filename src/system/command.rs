use crate::error::Error;
use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

pub type DynRunner = Arc<dyn CommandRunner + Send + Sync>;

/// An argv to execute, without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Overrides the runner's own timeout for this call.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Build from a configured argv list with per-call arguments appended.
    pub fn from_argv<I, S>(argv: &[String], extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (program, args) = argv.split_first().map_or_else(
            || (String::new(), Vec::new()),
            |(p, a)| (p.clone(), a.to_vec()),
        );
        let mut spec = Self {
            program,
            args,
            timeout: None,
        };
        spec.args.extend(extra.into_iter().map(Into::into));
        spec
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{arg}'")?;
            } else {
                write!(f, " {arg}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr joined, trimmed. Checkers disagree on which stream they report to.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.trim().to_string();
        let err = self.stderr.trim();
        if !err.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(err);
        }
        out
    }

    /// Turn a non-zero exit into [`Error::CommandFailed`].
    pub fn check(self, spec: &CommandSpec) -> Result<CommandOutput, Error> {
        if self.success() {
            Ok(self)
        } else {
            Err(Error::CommandFailed {
                command: spec.to_string(),
                status: self.status,
                output: self.combined(),
            })
        }
    }
}

/// Runs external programs. A non-zero exit status is returned as data, not as an error; only a
/// failure to run at all (missing binary, timeout) is an [`Error`].
#[async_trait::async_trait]
pub trait CommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, Error>;
}

/// Runs programs on the host with [`tokio::process`], killing them if they outlive `timeout`
/// or the spec's own timeout when it carries one.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait::async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, Error> {
        let timeout = spec.timeout.unwrap_or(self.timeout);
        tracing::debug!("running `{spec}`");
        let child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                Ok(CommandOutput {
                    status: output.status.code(),
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                })
            }
            Err(_) => {
                tracing::warn!("`{spec}` timed out after {timeout:?}");
                Err(Error::CommandTimeout {
                    command: spec.to_string(),
                    timeout,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_appends_call_arguments() {
        let argv = vec!["rndc".to_string(), "reload".to_string()];
        let spec = CommandSpec::from_argv(&argv, ["example.com"]);
        assert_eq!(spec.program, "rndc");
        assert_eq!(spec.args, vec!["reload", "example.com"]);
        assert_eq!(spec.to_string(), "rndc reload example.com");
    }

    #[test]
    fn failed_output_becomes_error() {
        let spec = CommandSpec::from_argv(&["nginx".to_string()], ["-t"]);
        let err = CommandOutput::failed(1, "unexpected \"}\"").check(&spec).unwrap_err();
        assert!(matches!(err, Error::CommandFailed { status: Some(1), .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_reports_exit_status() {
        let runner = SystemRunner::new(Duration::from_secs(10));
        let sh = ["sh".to_string(), "-c".to_string()];
        let spec = CommandSpec::from_argv(&sh, ["echo out; echo err >&2; exit 3"]);
        let output = runner.run(&spec).await.unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.combined(), "out\nerr");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn system_runner_times_out() {
        let runner = SystemRunner::new(Duration::from_millis(100));
        let spec = CommandSpec::from_argv(&["sleep".to_string()], ["5"]);
        assert!(matches!(
            runner.run(&spec).await,
            Err(Error::CommandTimeout { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn spec_timeout_overrides_runner_timeout() {
        let runner = SystemRunner::new(Duration::from_millis(100));
        let spec = CommandSpec::from_argv(&["sleep".to_string()], ["0.3"])
            .with_timeout(Duration::from_secs(10));
        assert!(runner.run(&spec).await.unwrap().success());

        let runner = SystemRunner::new(Duration::from_secs(10));
        let spec = CommandSpec::from_argv(&["sleep".to_string()], ["5"])
            .with_timeout(Duration::from_millis(100));
        let err = runner.run(&spec).await.unwrap_err();
        assert!(matches!(
            err,
            Error::CommandTimeout { timeout, .. } if timeout == Duration::from_millis(100)
        ));
    }
}
