//! External tool command wrapper
//!
//! Arguments are always passed as a list to the spawned program, never joined
//! into a shell string. Every invocation carries a wall-clock deadline and an
//! output cap; on expiry the child is killed and reaped before returning.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::debug;

use crate::error::{RawError, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 100 * 1024 * 1024;

/// Captured output of a successful invocation
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

pub struct ToolCommand {
    label: String,
    program: PathBuf,
    args: Vec<OsString>,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<Path>) -> Self {
        let program = program.as_ref().to_path_buf();
        Self {
            label: program.display().to_string(),
            program,
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Name used in errors and logs (the logical tool name)
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
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

    pub fn input(self, path: impl AsRef<Path>) -> Self {
        self.arg(path.as_ref().as_os_str().to_os_string())
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_output_bytes(mut self, max: usize) -> Self {
        self.max_output_bytes = max;
        self
    }

    pub async fn execute(self) -> Result<ToolOutput> {
        let started = Instant::now();

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => RawError::ToolNotFound(self.label.clone()),
                _ => RawError::execution(&self.label, format!("spawn failed: {}", e)),
            })?;

        debug!("{} spawned (pid {:?})", self.label, child.id());

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let cap = self.max_output_bytes;
        let label = self.label.as_str();

        let outcome = tokio::time::timeout(self.timeout, async {
            let (stdout, stderr) = tokio::try_join!(
                read_capped(stdout_pipe, cap, label),
                read_capped(stderr_pipe, cap, label),
            )?;
            let status = child.wait().await?;
            Ok::<_, RawError>((status, stdout, stderr))
        })
        .await;

        match outcome {
            Ok(Ok((status, stdout, stderr))) => {
                debug!(
                    "{} exited with {} after {}ms ({} bytes stdout)",
                    self.label,
                    status,
                    started.elapsed().as_millis(),
                    stdout.len()
                );
                check_status(&self.label, status, ToolOutput { stdout, stderr })
            }
            Ok(Err(err)) => {
                terminate(&mut child).await;
                Err(err)
            }
            Err(_) => {
                terminate(&mut child).await;
                debug!("{} killed after {}ms deadline", self.label, self.timeout.as_millis());
                Err(RawError::Timeout {
                    tool: self.label,
                    timeout_ms: self.timeout.as_millis() as u64,
                })
            }
        }
    }
}

async fn terminate(child: &mut tokio::process::Child) {
    let _ = child.start_kill();
    let _ = child.wait().await;
}

async fn read_capped<R>(pipe: Option<R>, cap: usize, label: &str) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(pipe) = pipe else {
        return Ok(Vec::new());
    };

    let mut buf = Vec::new();
    pipe.take(cap as u64 + 1).read_to_end(&mut buf).await?;

    if buf.len() > cap {
        return Err(RawError::execution(label, format!("output exceeded {} bytes", cap)));
    }
    Ok(buf)
}

fn check_status(label: &str, status: ExitStatus, output: ToolOutput) -> Result<ToolOutput> {
    if status.success() {
        return Ok(output);
    }

    let stderr = output.stderr_lossy();
    let tail: String = stderr.chars().rev().take(400).collect::<Vec<_>>().into_iter().rev().collect();
    Err(RawError::execution(label, format!("{}: {}", status, tail)))
}

/// Blocking run with a deadline, for one-off probes outside the runtime.
/// Returns `None` when the deadline expired (the child is killed).
/// Stdout is drained on a helper thread while the child runs.
pub fn run_blocking(
    mut command: std::process::Command,
    timeout: Duration,
) -> std::io::Result<Option<std::process::Output>> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()?;

    let reader = child.stdout.take().map(|mut pipe| {
        std::thread::spawn(move || {
            let mut buf = Vec::new();
            std::io::Read::read_to_end(&mut pipe, &mut buf).map(|_| buf)
        })
    });

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            let stdout = match reader {
                Some(handle) => handle
                    .join()
                    .map_err(|_| std::io::Error::other("stdout reader panicked"))??,
                None => Vec::new(),
            };
            return Ok(Some(std::process::Output {
                status,
                stdout,
                stderr: Vec::new(),
            }));
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            drop(reader);
            return Ok(None);
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}
