//! Job handler that runs an external scraper command.
//!
//! The command runs under `sh -c` once per job. It receives the job payload
//! as JSON on stdin and the job id, URL and attempt in `MARKUP_JOB_*`
//! variables. Lines of the form `PROGRESS <n>` on stdout are progress
//! reports; the rest of stdout is the job result, parsed as JSON when it is
//! JSON and kept as a string otherwise. A non-zero exit fails the attempt.

use async_trait::async_trait;
use markup_log::debug;
use markup_queue::{HandlerResult, JobContext, JobData, JobHandler};
use std::io;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};

/// Bytes of stderr kept in a failure message.
const STDERR_TAIL: usize = 2048;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("failed to start handler command: {0}")]
    Spawn(#[source] io::Error),

    #[error("handler command I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("could not encode payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("handler command timed out after {0:?}")]
    Timeout(Duration),

    #[error("handler command exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },
}

/// Runs a shell command per job.
#[derive(Debug, Clone)]
pub struct CommandHandler {
    command: String,
    timeout: Option<Duration>,
}

impl CommandHandler {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            timeout: None,
        }
    }

    /// Kill the command if it runs longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn spawn(&self, ctx: &JobContext) -> Result<Child, CommandError> {
        Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("MARKUP_JOB_ID", ctx.id().to_string())
            .env("MARKUP_JOB_URL", ctx.url().unwrap_or_default())
            .env("MARKUP_JOB_ATTEMPT", ctx.attempt().to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(CommandError::Spawn)
    }

    async fn run(&self, ctx: &JobContext) -> Result<JobData, CommandError> {
        let input = serde_json::to_vec(ctx.payload())?;
        let mut child = self.spawn(ctx)?;
        debug!(command = %self.command, pid = child.id(), "Started handler command");

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let write = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&input).await {
                    // The command is free to ignore its input.
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                    other => other?,
                }
            }
            Ok::<_, io::Error>(())
        };

        let read_stdout = async move {
            let mut output = String::new();
            if let Some(stdout) = stdout {
                let mut lines = BufReader::new(stdout).lines();
                while let Some(line) = lines.next_line().await? {
                    match parse_progress(&line) {
                        Some(progress) => ctx.report_progress(progress).await,
                        None => {
                            output.push_str(&line);
                            output.push('\n');
                        }
                    }
                }
            }
            Ok::<_, io::Error>(output)
        };

        let read_stderr = async move {
            let mut buf = String::new();
            if let Some(mut stderr) = stderr {
                stderr.read_to_string(&mut buf).await?;
            }
            Ok::<_, io::Error>(buf)
        };

        let (written, output, errors) = tokio::join!(write, read_stdout, read_stderr);
        written?;
        let output = output?;
        let errors = errors?;

        let status = child.wait().await?;
        if !status.success() {
            return Err(CommandError::Exit {
                status: status.to_string(),
                stderr: tail(errors.trim(), STDERR_TAIL).to_string(),
            });
        }
        Ok(parse_output(&output))
    }
}

#[async_trait]
impl JobHandler for CommandHandler {
    async fn handle(&self, ctx: JobContext) -> HandlerResult {
        let result = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, self.run(&ctx)).await {
                Ok(result) => result,
                Err(_) => Err(CommandError::Timeout(limit)),
            },
            None => self.run(&ctx).await,
        };
        result.map_err(Into::into)
    }
}

/// `PROGRESS 40` -> 40, clamped to 100.
fn parse_progress(line: &str) -> Option<u8> {
    let value = line.trim().strip_prefix("PROGRESS")?.trim();
    value.parse::<u32>().ok().map(|p| p.min(100) as u8)
}

fn parse_output(output: &str) -> JobData {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return JobData::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| JobData::String(trimmed.to_string()))
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
