//! Local subprocess controller.
//!
//! Runs each job's command as a child of this process through the
//! configured shell (default `/bin/sh -c`). Jobs with a `user` different
//! from the invoking one go through the privilege launcher instead:
//!
//! ```text
//! sudo -u <user> env LANG=.. PATH=.. <environ>=.. /bin/sh -c '<command>'
//! ```
//!
//! stdout and stderr are read line by line by two streams that are merged
//! into one timestamped I/O log. Every job gets a fresh scratch directory as
//! its working directory; files left in it are reported unless the job has
//! the `has-leftovers` flag.
//!
//! | Plugin | Behaviour |
//! |--------|-----------|
//! | `manual` | Not run, `undecided` |
//! | `qml` | Not run, `skip` |
//! | `user-interact-verify` | Run, then `undecided` |
//! | others | Run; exit 0 is `pass`, anything else `fail` |

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::{debug, info, warn};

use super::{
    ExecutionContext, ExecutionController, ExecutionError, ExecutionResult, JobOutput,
    forwarded_environment, job_environment,
};
use crate::session::iolog::io_log_filename;
use crate::session::{IoLogRecord, IoLogWriter, IoStream, JobResult, Outcome};
use crate::unit::{JobDefinition, Plugin};

/// Controller that runs jobs as local child processes.
pub struct LocalController {
    shell: String,
    launcher: String,
    timeout: Option<Duration>,
}

impl Default for LocalController {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalController {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            launcher: "sudo".to_string(),
            timeout: None,
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Sets the privilege launcher; it may carry its own arguments (`sudo -n`).
    pub fn with_launcher(mut self, launcher: impl Into<String>) -> Self {
        self.launcher = launcher.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn command(
        &self,
        job: &JobDefinition,
        command: &str,
        env: &BTreeMap<String, String>,
    ) -> ExecutionResult<tokio::process::Command> {
        let switch_user = job
            .user
            .as_deref()
            .filter(|user| std::env::var("USER").ok().as_deref() != Some(*user));

        let process = match switch_user {
            Some(user) => {
                let mut words = shell_words::split(&self.launcher).map_err(|e| {
                    ExecutionError::InvalidLauncher {
                        launcher: self.launcher.clone(),
                        reason: e.to_string(),
                    }
                })?;
                if words.is_empty() {
                    return Err(ExecutionError::InvalidLauncher {
                        launcher: self.launcher.clone(),
                        reason: "empty command".to_string(),
                    });
                }
                let program = words.remove(0);
                words.extend(["-u".to_string(), user.to_string(), "env".to_string()]);
                words.extend(
                    forwarded_environment(job, env)
                        .into_iter()
                        .map(|(k, v)| format!("{}={}", k, v)),
                );
                words.extend([self.shell.clone(), "-c".to_string(), command.to_string()]);
                debug!("Running {} as {}: {} {}", job.id, user, program, shell_words::join(&words));

                let mut process = tokio::process::Command::new(program);
                process.args(words);
                process
            }
            None => {
                let mut process = tokio::process::Command::new(&self.shell);
                process.arg("-c").arg(command);
                process.env_clear();
                process.envs(env);
                process
            }
        };
        Ok(process)
    }

    fn write_io_log(
        &self,
        job: &JobDefinition,
        ctx: &ExecutionContext,
        records: &[IoLogRecord],
    ) -> ExecutionResult<String> {
        let filename = io_log_filename(&job.id);
        let path = ctx.io_log_dir.join(&filename);
        let mut writer = IoLogWriter::create(&path)
            .with_context(|| format!("Failed to create I/O log {}", path.display()))?;
        for record in records {
            writer.write_record(record)?;
        }
        writer.finish()?;
        Ok(filename)
    }
}

#[async_trait]
impl ExecutionController for LocalController {
    async fn run_job(
        &self,
        job: &JobDefinition,
        ctx: &ExecutionContext,
    ) -> ExecutionResult<JobOutput> {
        match job.plugin {
            Plugin::Manual => {
                return Ok(JobOutput::new(
                    JobResult::new(Outcome::Undecided)
                        .with_comments("manual job; the operator decides the outcome"),
                ));
            }
            Plugin::Qml => {
                return Ok(JobOutput::new(
                    JobResult::new(Outcome::Skip)
                        .with_comments("qml jobs are not supported by the local controller"),
                ));
            }
            _ => {}
        }
        let Some(command) = job.command.as_deref().filter(|c| !c.trim().is_empty()) else {
            return Ok(JobOutput::new(
                JobResult::new(Outcome::Fail).with_comments("job has no command"),
            ));
        };

        let scratch = tempfile::Builder::new().prefix("checkplan-job-").tempdir()?;
        let env = job_environment(job, ctx, std::env::vars());
        let mut process = self.command(job, command, &env)?;
        process
            .current_dir(scratch.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!("Running {}", job.id);
        let start = Instant::now();
        let mut child = match process.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to start {}: {}", job.id, e);
                return Ok(JobOutput::new(
                    JobResult::new(Outcome::Fail).with_comments(format!("failed to start: {}", e)),
                ));
            }
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::NotCaptured(job.id.clone()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecutionError::NotCaptured(job.id.clone()))?;
        let output = stream::select(
            output_lines(stdout, IoStream::Stdout),
            output_lines(stderr, IoStream::Stderr),
        );

        let mut records = Vec::new();
        let captured = capture(&mut child, output, &mut records, start);
        let status = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, captured).await {
                Ok(status) => Some(status?),
                Err(_) => {
                    warn!("{} timed out after {}s", job.id, limit.as_secs());
                    child.kill().await?;
                    None
                }
            },
            None => Some(captured.await?),
        };
        let duration = start.elapsed().as_secs_f64();

        let mut comments = Vec::new();
        let mut result = match status {
            Some(status) => {
                let outcome = match (job.plugin, status.success()) {
                    (Plugin::UserInteractVerify, _) => Outcome::Undecided,
                    (_, true) => Outcome::Pass,
                    (_, false) => Outcome::Fail,
                };
                let mut result = JobResult::new(outcome);
                match status.code() {
                    Some(code) => result = result.with_return_code(code),
                    None => comments.push("terminated by a signal".to_string()),
                }
                result
            }
            None => {
                comments.push(format!(
                    "timed out after {}s",
                    self.timeout.map(|t| t.as_secs()).unwrap_or_default()
                ));
                JobResult::new(Outcome::Fail)
            }
        };

        if !job.has_leftovers() {
            let leftovers = leftovers(scratch.path())?;
            if !leftovers.is_empty() {
                warn!("{} left files behind: {}", job.id, leftovers.join(", "));
                comments.push(format!("left files behind: {}", leftovers.join(", ")));
            }
        }

        let filename = self.write_io_log(job, ctx, &records)?;
        result = result.with_io_log(filename).with_duration(duration);
        if !comments.is_empty() {
            result = result.with_comments(comments.join("; "));
        }
        debug!(
            "{} finished with {} after {:.2}s ({} records)",
            job.id,
            result.outcome,
            duration,
            records.len()
        );
        Ok(JobOutput::new(result).with_io_log(records))
    }
}

/// Lines of one pipe, each with its newline if it had one.
fn output_lines<R>(reader: R, stream: IoStream) -> impl Stream<Item = (IoStream, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    stream::unfold(BufReader::new(reader), move |mut reader| async move {
        let mut line = Vec::new();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) => None,
            Ok(_) => Some(((stream, line), reader)),
            Err(e) => {
                warn!("Stopped reading {:?}: {}", stream, e);
                None
            }
        }
    })
}

/// Drains `output` into `records`, then waits for the child.
async fn capture(
    child: &mut Child,
    output: impl Stream<Item = (IoStream, Vec<u8>)>,
    records: &mut Vec<IoLogRecord>,
    start: Instant,
) -> std::io::Result<std::process::ExitStatus> {
    let mut output = std::pin::pin!(output);
    let mut last = start;
    while let Some((stream, data)) = output.next().await {
        let now = Instant::now();
        records.push(IoLogRecord::new(
            now.duration_since(last).as_secs_f64(),
            stream,
            data,
        ));
        last = now;
    }
    child.wait().await
}

fn leftovers(dir: &Path) -> std::io::Result<Vec<String>> {
    let mut names: Vec<String> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    Ok(names)
}
