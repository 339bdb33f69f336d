//! External process execution with concurrent stream handling.
//!
//! Running a child with piped stdin, stdout and stderr deadlocks if
//! the streams are serviced one at a time: a child blocked writing a
//! full stderr pipe never drains stdout, and a child blocked reading
//! stdin never writes anything. All three streams are therefore driven
//! concurrently and joined before the exit status is inspected.
//!
//! Failures on individual streams are collected, not short-circuited:
//! a stdin write error must not abandon the stdout and stderr readers,
//! or the child's remaining output is lost and the pipes leak until
//! the child exits on its own.

use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Read chunk size for child output pipes.
const CHUNK_SIZE: usize = 64 * 1024;

/// Errors from running an external command.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The child process could not be started at all.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Underlying OS error.
        source: std::io::Error,
    },

    /// The command ran but did not succeed: stream errors occurred or
    /// the exit status was non-zero.
    #[error("{summary}")]
    Failed {
        /// One-line description including the program name.
        summary: String,
        /// Per-stream failures, labelled with the stream name and
        /// keeping the original error kind. Possibly empty.
        failures: Vec<std::io::Error>,
        /// Everything the child wrote to stderr.
        stderr: String,
        /// Exit code, if the child exited normally.
        code: Option<i32>,
    },

    /// The child's captured stdout was requested as text but is not
    /// valid UTF-8.
    #[error("{program} produced non-UTF-8 output")]
    NonUtf8Output {
        /// Program whose output could not be decoded.
        program: String,
    },
}

/// Captured result of a successful [`ExecCommand::run_capture`].
#[derive(Debug)]
pub struct ExecOutput {
    /// Raw stdout bytes.
    pub stdout: Vec<u8>,
    /// Decoded stderr (lossy; diagnostics need not be strict UTF-8).
    pub stderr: String,
}

impl ExecOutput {
    /// Captured stdout as text.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::NonUtf8Output`] if stdout is not UTF-8;
    /// `program` names the command for the error message.
    pub fn text(self, program: &str) -> Result<String, ExecError> {
        String::from_utf8(self.stdout).map_err(|_| ExecError::NonUtf8Output {
            program: program.to_string(),
        })
    }
}

/// Consumes child stdout incrementally during streaming execution.
pub trait OutputConsumer: Send {
    /// Handle one chunk of child stdout.
    ///
    /// # Errors
    ///
    /// An error here counts as a stdout stream failure for the run;
    /// remaining output is discarded but the other streams still run
    /// to completion.
    fn consume(&mut self, chunk: &[u8]) -> std::io::Result<()>;
}

impl<F> OutputConsumer for F
where
    F: FnMut(&[u8]) -> std::io::Result<()> + Send,
{
    fn consume(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self(chunk)
    }
}

/// Builder for one external command invocation.
#[derive(Debug)]
pub struct ExecCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<String>,
    stdin: Vec<u8>,
}

impl ExecCommand {
    /// Start building an invocation of `program`.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: Vec::new(),
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the working directory for the child.
    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<String>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Bytes to feed the child on stdin. Empty input still closes the
    /// pipe promptly so the child sees EOF.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = input.into();
        self
    }

    /// The program name, for error messages.
    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run the command, capturing stdout in memory.
    ///
    /// # Errors
    ///
    /// See [`run_streaming`](Self::run_streaming); the success
    /// contract is identical.
    pub async fn run_capture(self) -> Result<ExecOutput, ExecError> {
        let mut captured = Vec::new();
        let consumer = |chunk: &[u8]| -> std::io::Result<()> {
            captured.extend_from_slice(chunk);
            Ok(())
        };
        let stderr = self.run_streaming(consumer).await?;
        Ok(ExecOutput {
            stdout: captured,
            stderr,
        })
    }

    /// Run the command, handing stdout chunks to `consumer` as they
    /// arrive, and return the collected stderr text on success.
    ///
    /// Success requires all of: no stream failures, and a zero exit
    /// status. A non-zero exit is always a failure even if every
    /// stream drained cleanly; the stderr text is carried in the error
    /// so callers can surface the child's own diagnostics.
    ///
    /// If the child exits successfully but wrote to stderr, the text
    /// is logged as a warning and also returned.
    ///
    /// # Errors
    ///
    /// [`ExecError::Spawn`] if the process cannot start;
    /// [`ExecError::Failed`] for stream errors or non-zero exit.
    pub async fn run_streaming<C: OutputConsumer>(
        self,
        mut consumer: C,
    ) -> Result<String, ExecError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        debug!(program = %self.program, args = ?self.args, "spawning child process");

        let mut child = command.spawn().map_err(|source| ExecError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // The three pipes are always present under Stdio::piped.
        let mut stdin_pipe = child.stdin.take().expect("child stdin is piped");
        let mut stdout_pipe = child.stdout.take().expect("child stdout is piped");
        let mut stderr_pipe = child.stderr.take().expect("child stderr is piped");

        let input = self.stdin;
        let stdin_future = async move {
            let result = async {
                if !input.is_empty() {
                    stdin_pipe.write_all(&input).await?;
                }
                stdin_pipe.shutdown().await
            }
            .await;
            // Dropping the handle closes the pipe even on error.
            drop(stdin_pipe);
            result
        };

        let stdout_future = async {
            let mut chunk = vec![0u8; CHUNK_SIZE];
            let mut failed: Option<std::io::Error> = None;
            loop {
                let n = match stdout_pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) => {
                        if failed.is_none() {
                            failed = Some(e);
                        }
                        break;
                    }
                };
                if failed.is_none() {
                    if let Err(e) = consumer.consume(&chunk[..n]) {
                        // Keep reading to EOF so the child is never
                        // blocked on a full stdout pipe; the rest of
                        // the output is discarded.
                        failed = Some(e);
                    }
                }
            }
            match failed {
                Some(e) => Err(e),
                None => Ok(()),
            }
        };

        let stderr_future = async {
            let mut collected = Vec::new();
            let mut chunk = vec![0u8; CHUNK_SIZE];
            let result = loop {
                match stderr_pipe.read(&mut chunk).await {
                    Ok(0) => break Ok(()),
                    Ok(n) => collected.extend_from_slice(&chunk[..n]),
                    Err(e) => break Err(e),
                }
            };
            (result, collected)
        };

        let (stdin_result, stdout_result, (stderr_result, stderr_bytes)) =
            tokio::join!(stdin_future, stdout_future, stderr_future);

        let status = child.wait().await;
        let stderr_text = String::from_utf8_lossy(&stderr_bytes).into_owned();

        let failures = collect_failures(
            stdin_result.err().as_ref(),
            stdout_result.err().as_ref(),
            stderr_result.err().as_ref(),
        );

        let status = match status {
            Ok(status) => status,
            Err(e) => {
                let mut failures = failures;
                let kind = e.kind();
                failures.push(std::io::Error::new(kind, format!("wait: {e}")));
                return Err(ExecError::Failed {
                    summary: format!("{} did not complete", self.program),
                    failures,
                    stderr: stderr_text,
                    code: None,
                });
            }
        };

        if !failures.is_empty() || !status.success() {
            let summary = match status.code() {
                Some(code) if !failures.is_empty() => format!(
                    "{} failed (exit code {code}, {} stream errors)",
                    self.program,
                    failures.len()
                ),
                Some(code) => format!("{} exited with code {code}", self.program),
                None => format!("{} terminated by signal", self.program),
            };
            return Err(ExecError::Failed {
                summary,
                failures,
                stderr: stderr_text,
                code: status.code(),
            });
        }

        if !stderr_text.is_empty() {
            warn!(program = %self.program, stderr = %stderr_text, "command succeeded with stderr output");
        }

        Ok(stderr_text)
    }
}

/// Label and collect per-stream errors in a stable order, keeping each
/// error's kind so callers can classify the failure.
fn collect_failures(
    stdin: Option<&std::io::Error>,
    stdout: Option<&std::io::Error>,
    stderr: Option<&std::io::Error>,
) -> Vec<std::io::Error> {
    fn labelled(label: &str, e: &std::io::Error) -> std::io::Error {
        std::io::Error::new(e.kind(), format!("{label}: {e}"))
    }

    let mut failures = Vec::new();
    if let Some(e) = stdin {
        // A child that exits without reading its stdin closes the pipe;
        // that is not a failure of the run.
        if e.kind() != std::io::ErrorKind::BrokenPipe {
            failures.push(labelled("stdin", e));
        }
    }
    if let Some(e) = stdout {
        failures.push(labelled("stdout", e));
    }
    if let Some(e) = stderr {
        failures.push(labelled("stderr", e));
    }
    failures
}
