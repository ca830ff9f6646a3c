// service-backup/src/executor/process.rs
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use which::which;

use crate::BoxReader;
use crate::errors::{BackupError, Result};

/// Finds `program` in the system PATH.
pub fn find_executable(program: &str) -> Result<PathBuf> {
    which(program).map_err(|e| {
        BackupError::execution_with(
            format!(
                "{program} executable not found in PATH. Please ensure the client tools are installed and in your PATH."
            ),
            e,
        )
    })
}

/// A tool invocation: program, arguments and extra environment.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    pub program: &'static str,
    pub args: Vec<OsString>,
    pub envs: Vec<(&'static str, String)>,
}

impl Invocation {
    pub fn new(program: &'static str) -> Self {
        Self {
            program,
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &'static str, value: Option<&str>) -> Self {
        if let Some(value) = value {
            self.envs.push((key, value.to_string()));
        }
        self
    }

    fn command(&self, stdin: Stdio, stdout: Stdio) -> Result<Command> {
        let path = find_executable(self.program)?;
        let mut command = Command::new(path);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(stdin)
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        Ok(command)
    }

    fn spawn(&self, stdin: Stdio, stdout: Stdio) -> Result<Child> {
        debug!(program = self.program, args = ?self.args, "spawning");
        self.command(stdin, stdout)?.spawn().map_err(|e| {
            BackupError::execution_with(format!("failed to execute {}", self.program), e)
        })
    }

    /// Runs the tool and streams its stdout.
    ///
    /// The returned reader reports a non-zero exit status, or cancellation,
    /// as an error once stdout is exhausted. Dropping the reader kills the
    /// tool.
    pub fn stream_stdout(&self, cancel: CancellationToken) -> Result<BoxReader> {
        let mut child = self.spawn(Stdio::null(), Stdio::piped())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackupError::execution("child stdout was not captured"))?;
        let stderr = child.stderr.take();
        let program = self.program;

        let exit = tokio::spawn(async move {
            let outcome = tokio::select! {
                outcome = wait_with_stderr(&mut child, stderr) => Some(outcome),
                _ = cancel.cancelled() => None,
            };
            match outcome {
                Some((Ok(status), _)) if status.success() => Ok(()),
                Some((Ok(status), stderr)) => Err(io::Error::other(format!(
                    "{program} failed with status {status}: {}",
                    stderr.trim()
                ))),
                Some((Err(e), _)) => Err(e),
                None => {
                    kill(&mut child, program).await;
                    Err(io::Error::new(
                        io::ErrorKind::Interrupted,
                        format!("{program} was cancelled"),
                    ))
                }
            }
        });

        Ok(Box::pin(ChildOutput {
            stdout,
            exit,
            done: false,
        }))
    }

    /// Runs the tool with `input` piped to its stdin and waits for it.
    ///
    /// If `input` fails midway the tool is killed while its stdin is still
    /// open, so it never sees a clean end of input and cannot commit the
    /// partial data.
    pub async fn feed_stdin(&self, mut input: BoxReader, cancel: &CancellationToken) -> Result<()> {
        let mut child = self.spawn(Stdio::piped(), Stdio::null())?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackupError::execution("child stdin was not captured"))?;
        let stderr = tokio::spawn(read_stderr(child.stderr.take()));
        let program = self.program;

        let copied = tokio::select! {
            copied = tokio::io::copy(&mut input, &mut stdin) => copied,
            _ = cancel.cancelled() => {
                kill(&mut child, program).await;
                return Err(BackupError::execution(format!("{program} was cancelled")));
            }
        };

        let copied = match copied {
            Ok(n) => n,
            Err(e) => {
                kill(&mut child, program).await;
                drop(stdin);
                let stderr = stderr.await.unwrap_or_default();
                return Err(BackupError::execution_with(
                    format!("failed to stream backup into {program}: {}", stderr.trim()),
                    e,
                ));
            }
        };

        if let Err(e) = stdin.shutdown().await {
            debug!(program, error = %e, "closing stdin failed");
        }
        drop(stdin);

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancel.cancelled() => {
                kill(&mut child, program).await;
                return Err(BackupError::execution(format!("{program} was cancelled")));
            }
        };
        let stderr = stderr.await.unwrap_or_default();

        let status = status
            .map_err(|e| BackupError::execution_with(format!("failed to wait for {program}"), e))?;
        if !status.success() {
            return Err(BackupError::execution(format!(
                "{program} failed with status {status}: {}",
                stderr.trim()
            )));
        }
        debug!(program, bytes = copied, "restore input consumed");
        Ok(())
    }
}

async fn kill(child: &mut Child, program: &str) {
    if let Err(e) = child.kill().await {
        warn!(program, error = %e, "could not kill process");
    }
}

async fn read_stderr(stderr: Option<ChildStderr>) -> String {
    let mut text = String::new();
    if let Some(mut stderr) = stderr {
        if let Err(e) = stderr.read_to_string(&mut text).await {
            text = format!("<stderr unreadable: {e}>");
        }
    }
    text
}

async fn wait_with_stderr(
    child: &mut Child,
    stderr: Option<ChildStderr>,
) -> (io::Result<std::process::ExitStatus>, String) {
    let text = read_stderr(stderr).await;
    (child.wait().await, text)
}

/// Stdout of a running tool that turns its exit status into the stream's
/// final result.
struct ChildOutput {
    stdout: ChildStdout,
    exit: JoinHandle<io::Result<()>>,
    done: bool,
}

impl AsyncRead for ChildOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > before || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // stdout is exhausted, the tool's exit status decides
        let exit = ready!(Pin::new(&mut this.exit).poll(cx));
        this.done = true;
        match exit {
            Ok(result) => Poll::Ready(result),
            Err(join_err) => Poll::Ready(Err(io::Error::other(join_err))),
        }
    }
}

impl Drop for ChildOutput {
    fn drop(&mut self) {
        if !self.done {
            self.exit.abort();
        }
    }
}
