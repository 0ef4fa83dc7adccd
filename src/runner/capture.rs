//! Subprocess execution with combined output capture.
//!
//! stdout and stderr are drained by two spawned tasks into one shared sink
//! while being mirrored to the console. Ordering is preserved within each
//! stream; how the two streams interleave in the sink depends on scheduling.
//! Each task also keeps its own stream so machine-readable stdout survives
//! diagnostics on stderr. Both tasks are joined before [`run`] returns.

use crate::error::{HarnessError, Result};
use std::io;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

type Sink = Arc<Mutex<Vec<u8>>>;

/// Where a drained stream is mirrored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Console {
    Stdout,
    Stderr,
}

/// Output of a finished subprocess.
#[derive(Debug, Clone)]
pub struct Captured {
    /// Exit status
    pub status: ExitStatus,
    /// stdout and stderr in arrival order
    pub output: Vec<u8>,
    /// stdout alone
    pub stdout: Vec<u8>,
}

/// Render a command line for logs and error messages.
pub fn render(command: &Command) -> String {
    let command = command.as_std();
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `command` to completion, returning what it wrote.
///
/// With `mirror` set, output is also copied live to this process's stdout and
/// stderr. Cancelling `ctx` kills the child and abandons the drains.
///
/// # Errors
///
/// - [`HarnessError::Cancelled`] if `ctx` is cancelled before the child exits
/// - [`HarnessError::Process`] with the full combined output on non-zero exit
/// - [`HarnessError::Io`] if the child cannot be spawned
pub async fn run(command: Command, ctx: &CancellationToken, mirror: bool) -> Result<Captured> {
    let rendered = render(&command);
    let captured = run_unchecked(command, ctx, mirror).await?;

    if !captured.status.success() {
        return Err(HarnessError::Process {
            command: rendered,
            exit_code: captured.status.code().map(i64::from),
            output: String::from_utf8_lossy(&captured.output).into_owned(),
        });
    }

    Ok(captured)
}

/// Like [`run`], but a non-zero exit is returned to the caller instead of
/// being turned into an error.
///
/// # Errors
///
/// - [`HarnessError::Cancelled`] if `ctx` is cancelled before the child exits
/// - [`HarnessError::Io`] if the child cannot be spawned
pub async fn run_unchecked(
    mut command: Command,
    ctx: &CancellationToken,
    mirror: bool,
) -> Result<Captured> {
    let rendered = render(&command);

    if ctx.is_cancelled() {
        return Err(HarnessError::Cancelled(format!("`{}` was not started", rendered)));
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    debug!(
        "Running `{}` in {:?}",
        rendered,
        command.as_std().get_current_dir()
    );

    let mut child = command
        .spawn()
        .map_err(|e| io::Error::new(e.kind(), format!("failed to spawn `{}`: {}", rendered, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("child stdout was not captured"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| io::Error::other("child stderr was not captured"))?;

    let sink: Sink = Arc::new(Mutex::new(Vec::new()));
    let mut stdout_task = tokio::spawn(drain(stdout, sink.clone(), mirror.then_some(Console::Stdout)));
    let mut stderr_task = tokio::spawn(drain(stderr, sink.clone(), mirror.then_some(Console::Stderr)));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = ctx.cancelled() => {
            warn!("Cancelling `{}`", rendered);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill `{}`: {}", rendered, e);
            }
            stdout_task.abort();
            stderr_task.abort();
            return Err(HarnessError::Cancelled(format!("`{}` was cancelled", rendered)));
        }
    };

    // Descendants can keep the pipes open after the child exits.
    let stdout = tokio::select! {
        stdout = join_drains(&mut stdout_task, &mut stderr_task) => stdout,
        _ = ctx.cancelled() => {
            stdout_task.abort();
            stderr_task.abort();
            return Err(HarnessError::Cancelled(format!(
                "`{}` exited but its output was still draining when cancelled",
                rendered
            )));
        }
    };

    let output = std::mem::take(&mut *sink.lock().unwrap_or_else(PoisonError::into_inner));
    debug!("`{}` exited with {} ({} bytes of output)", rendered, status, output.len());
    Ok(Captured {
        status,
        output,
        stdout,
    })
}

type Drain = JoinHandle<io::Result<Vec<u8>>>;

/// Wait for both drains and hand back what the stdout drain kept.
async fn join_drains(stdout: &mut Drain, stderr: &mut Drain) -> Vec<u8> {
    let (out, err) = tokio::join!(stdout, stderr);
    let mut kept = Vec::new();
    for (result, is_stdout) in [(out, true), (err, false)] {
        match result {
            Ok(Ok(stream)) if is_stdout => kept = stream,
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!("Output drain failed: {}", e),
            Err(e) => warn!("Output drain task failed: {}", e),
        }
    }
    kept
}

async fn drain<R>(mut reader: R, sink: Sink, mirror: Option<Console>) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut stream = Vec::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(stream);
        }
        let chunk = &buf[..n];
        stream.extend_from_slice(chunk);

        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(chunk);

        // A closed console must not stop the capture.
        let mirrored = match mirror {
            Some(Console::Stdout) => tokio::io::stdout().write_all(chunk).await,
            Some(Console::Stderr) => tokio::io::stderr().write_all(chunk).await,
            None => Ok(()),
        };
        if let Err(e) = mirrored {
            debug!("Console mirror failed: {}", e);
        }
    }
}
