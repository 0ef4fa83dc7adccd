//! Container command execution.
//!
//! Runs a shell command through the engine's exec API and collects stdout
//! and stderr into one buffer in arrival order.
//!
//! The engine cannot signal an exec instance, and the pid it reports lives
//! in the host's namespace. Every exec therefore carries a unique
//! [`EXEC_MARKER_VAR`] value that its descendants inherit; cancelling sends
//! a second exec that signals each process whose environment holds it.

use crate::env::harness::{EXEC_KILL_GRACE_SECS, EXEC_MARKER_VAR};
use crate::error::{HarnessError, Result};
use crate::harness::{ExecConfig, ExecOutput};
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::stream::StreamExt;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Signals every process tagged with `$1`: TERM, up to `$2` seconds of
/// polling, then KILL. Zombies have an unreadable environ and are skipped.
const KILL_SCRIPT: &str = r#"marker="$1"; grace="$2"
tagged() {
  for dir in /proc/[0-9]*; do
    tr '\0' '\n' < "$dir/environ" 2>/dev/null | grep -qxF "$marker" && echo "${dir#/proc/}"
  done
}
pids=$(tagged)
[ -z "$pids" ] && exit 0
kill -TERM $pids 2>/dev/null
i=0
while [ "$i" -lt "$grace" ]; do
  sleep 1
  pids=$(tagged)
  [ -z "$pids" ] && exit 0
  i=$((i + 1))
done
kill -KILL $pids 2>/dev/null
exit 0"#;

/// Build the engine exec options for a harness command tagged with `marker`.
pub fn exec_options(config: &ExecConfig, marker: &str) -> CreateExecOptions<String> {
    let mut env = config.env.to_vec();
    env.push(marker.to_string());

    CreateExecOptions {
        cmd: Some(vec!["sh".to_string(), "-c".to_string(), config.command.clone()]),
        env: Some(env),
        working_dir: if config.working_dir.is_empty() {
            None
        } else {
            Some(config.working_dir.clone())
        },
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        ..Default::default()
    }
}

/// Options for the exec that stops everything tagged with `marker`.
pub fn kill_options(marker: &str) -> CreateExecOptions<String> {
    CreateExecOptions {
        cmd: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            KILL_SCRIPT.to_string(),
            "testrig-kill".to_string(),
            marker.to_string(),
            EXEC_KILL_GRACE_SECS.to_string(),
        ]),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        ..Default::default()
    }
}

fn new_marker() -> String {
    format!("{}={}", EXEC_MARKER_VAR, Uuid::new_v4())
}

/// Execute a command in a running container.
///
/// A non-zero exit is reported through [`ExecOutput::exit_code`], not as an
/// error. Once the exec exists, cancelling `ctx` also stops the command and
/// everything it spawned before returning.
///
/// # Errors
///
/// Returns [`HarnessError::Cancelled`] if `ctx` is cancelled, or
/// [`HarnessError::Backend`] if the engine rejects the exec.
pub async fn execute(
    docker: &Docker,
    container_id: &str,
    config: &ExecConfig,
    ctx: &CancellationToken,
) -> Result<ExecOutput> {
    debug!(
        "Executing command in container {}: {:?}",
        container_id, config.command
    );

    let marker = new_marker();

    let exec = tokio::select! {
        _ = ctx.cancelled() => return Err(cancelled(container_id)),
        exec = docker.create_exec(container_id, exec_options(config, &marker)) => exec?,
    };

    let start_results = tokio::select! {
        _ = ctx.cancelled() => return Err(stop(docker, container_id, &marker).await),
        started = docker.start_exec(&exec.id, None) => started?,
    };

    let mut output = Vec::new();
    match start_results {
        StartExecResults::Attached { output: mut stream, .. } => loop {
            let next = tokio::select! {
                _ = ctx.cancelled() => return Err(stop(docker, container_id, &marker).await),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(log)) => output.extend_from_slice(&log.into_bytes()),
                Some(Err(e)) => {
                    return Err(HarnessError::backend(format!(
                        "failed to read exec output: {}",
                        e
                    )));
                }
                None => break,
            }
        },
        StartExecResults::Detached => {
            return Err(HarnessError::backend("unexpected detached execution"));
        }
    }

    let inspect = docker.inspect_exec(&exec.id).await?;
    let exit_code = inspect.exit_code;

    debug!("Command executed with exit code: {:?}", exit_code);

    Ok(ExecOutput { output, exit_code })
}

/// Kill the processes of a cancelled exec, then report the cancellation.
async fn stop(docker: &Docker, container_id: &str, marker: &str) -> HarnessError {
    let budget = Duration::from_secs(EXEC_KILL_GRACE_SECS + 5);
    match tokio::time::timeout(budget, kill(docker, container_id, marker)).await {
        Ok(Ok(())) => debug!("Stopped cancelled exec in container {}", container_id),
        Ok(Err(e)) => warn!(
            "Failed to stop cancelled exec in container {}: {}",
            container_id, e
        ),
        Err(_) => warn!(
            "Timed out stopping cancelled exec in container {}",
            container_id
        ),
    }
    cancelled(container_id)
}

async fn kill(docker: &Docker, container_id: &str, marker: &str) -> Result<()> {
    let exec = docker.create_exec(container_id, kill_options(marker)).await?;
    if let StartExecResults::Attached { output: mut stream, .. } =
        docker.start_exec(&exec.id, None).await?
    {
        while let Some(next) = stream.next().await {
            next?;
        }
    }
    Ok(())
}

fn cancelled(container_id: &str) -> HarnessError {
    HarnessError::Cancelled(format!("exec in container {}", container_id))
}
