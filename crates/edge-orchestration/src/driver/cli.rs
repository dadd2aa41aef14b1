//! Subprocess plumbing for CLI-driven backends.

use crate::model::{LogLine, LogSource};
use crate::runtime::timeout;
use crate::{Error, Result};
use async_process::{Command, Stdio};
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use futures_lite::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use std::time::Duration;
use tracing::debug;

/// Captured output of a finished command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stderr if present, otherwise stdout, trimmed
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Runs a backend CLI binary with a per-invocation deadline
#[derive(Debug, Clone)]
pub struct CliRunner {
    program: String,
    global_args: Vec<String>,
    env: Vec<(String, String)>,
    timeout: Duration,
}

impl CliRunner {
    /// Runner for `program` with a default 60s deadline
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
            env: Vec::new(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Arguments placed before every invocation's own arguments
    pub fn with_global_args(mut self, args: Vec<String>) -> Self {
        self.global_args = args;
        self
    }

    /// Extra environment variable for every invocation
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Deadline for each invocation
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Binary being run
    pub fn program(&self) -> &str {
        &self.program
    }

    fn command<S: AsRef<str>>(&self, args: &[S]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.global_args);
        cmd.args(args.iter().map(AsRef::as_ref));
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::BackendUnreachable(format!("'{}' not found: {}", self.program, e))
        } else {
            Error::Io(e)
        }
    }

    /// Run to completion and capture output
    pub async fn run<S: AsRef<str>>(&self, args: &[S]) -> Result<CommandOutput> {
        debug!(
            "Running {} {}",
            self.program,
            args.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ")
        );
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null());
        let output = timeout(&self.program, self.timeout, async {
            cmd.output().await.map_err(|e| self.spawn_error(e))
        })
        .await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run with `input` written to stdin
    pub async fn run_with_stdin<S: AsRef<str>>(&self, args: &[S], input: &str) -> Result<CommandOutput> {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = timeout(&self.program, self.timeout, async {
            let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes()).await?;
                stdin.close().await?;
            }
            child.output().await.map_err(Error::Io)
        })
        .await?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and return stdout, mapping a non-zero exit to [`Error::Backend`]
    pub async fn run_checked<S: AsRef<str>>(&self, args: &[S]) -> Result<String> {
        let output = self.run(args).await?;
        if output.success() {
            Ok(output.stdout)
        } else {
            Err(Error::Backend(format!(
                "{} {} failed: {}",
                self.program,
                args.first().map(AsRef::as_ref).unwrap_or_default(),
                output.message()
            )))
        }
    }

    /// Spawn a long-running command and stream its output lines.
    ///
    /// The child lives as long as the stream; dropping the stream kills it.
    pub fn stream_lines<S: AsRef<str>>(
        &self,
        args: &[S],
        parse_timestamps: bool,
    ) -> Result<BoxStream<'static, Result<LogLine>>> {
        let mut cmd = self.command(args);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(|e| self.spawn_error(e))?;

        let stdout = child.stdout.take().map(|out| {
            BufReader::new(out)
                .lines()
                .map(move |line| to_log_line(line, LogSource::Stdout, parse_timestamps))
                .boxed()
        });
        let stderr = child.stderr.take().map(|err| {
            BufReader::new(err)
                .lines()
                .map(move |line| to_log_line(line, LogSource::Stderr, parse_timestamps))
                .boxed()
        });

        let merged = stream::select(
            stdout.unwrap_or_else(|| stream::empty().boxed()),
            stderr.unwrap_or_else(|| stream::empty().boxed()),
        );

        let lines = stream::unfold((merged, child), |(mut merged, child)| async move {
            let item = merged.next().await?;
            Some((item, (merged, child)))
        });
        Ok(lines.boxed())
    }
}

fn to_log_line(line: std::io::Result<String>, source: LogSource, parse_timestamps: bool) -> Result<LogLine> {
    let line = line?;
    if parse_timestamps {
        if let Some((stamp, rest)) = line.split_once(' ') {
            if let Ok(timestamp) = DateTime::parse_from_rfc3339(stamp) {
                return Ok(LogLine {
                    source,
                    message: rest.to_string(),
                    timestamp: Some(timestamp.with_timezone(&Utc)),
                });
            }
        }
    }
    Ok(LogLine {
        source,
        message: line,
        timestamp: None,
    })
}
