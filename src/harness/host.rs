//! Host command execution.
//!
//! Runs harness commands directly on this machine with `sh -c`, inside a
//! scratch directory owned by the harness. Injected files are unpacked from
//! their archives beneath that directory, so `/etc/app/config.yaml` lands at
//! `<root>/etc/app/config.yaml`.

use crate::error::{HarnessError, Result};
use crate::harness::{ExecConfig, ExecOutput, Runtime, archive};
use crate::harness::request::{Env, File};
use crate::runner::capture;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Scratch-directory backend.
#[derive(Debug)]
pub struct HostRuntime {
    id: String,
    env: Env,
    files: Vec<File>,
    mirror_output: bool,
    root: Option<TempDir>,
}

impl HostRuntime {
    /// Create a backend for harness `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            env: Env::new(),
            files: Vec::new(),
            mirror_output: false,
            root: None,
        }
    }

    /// Environment applied to every command.
    pub fn with_env(mut self, env: Env) -> Self {
        self.env = env;
        self
    }

    /// Files injected into the scratch directory on start.
    pub fn with_files(mut self, files: Vec<File>) -> Self {
        self.files = files;
        self
    }

    /// Mirror command output to the console.
    pub fn with_mirror_output(mut self, mirror: bool) -> Self {
        self.mirror_output = mirror;
        self
    }

    /// Scratch directory, once started.
    pub fn root(&self) -> Option<&Path> {
        self.root.as_ref().map(TempDir::path)
    }

    fn resolve(root: &Path, path: &str) -> PathBuf {
        root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Runtime for HostRuntime {
    async fn start(&mut self, ctx: &CancellationToken) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(HarnessError::Cancelled(format!(
                "host harness {} was not started",
                self.id
            )));
        }

        let root = tempfile::Builder::new()
            .prefix(&format!("testrig-host-{}-", self.id))
            .tempdir()?;

        for file in &self.files {
            let dir = Self::resolve(root.path(), file.parent_dir());
            std::fs::create_dir_all(&dir)?;
            let unpacked = archive::unpack(&file.archive()?, &dir)?;
            debug!("Injected {:?} into host harness {}", unpacked, self.id);
        }

        info!(
            "Host harness {} using {}",
            self.id,
            root.path().display()
        );
        self.root = Some(root);
        Ok(())
    }

    async fn teardown(&mut self, _ctx: &CancellationToken) -> Result<()> {
        if let Some(root) = self.root.take() {
            debug!("Removing {}", root.path().display());
            root.close()?;
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &CancellationToken, config: &ExecConfig) -> Result<ExecOutput> {
        let root = self.root().ok_or_else(|| HarnessError::InvalidState {
            operation: "exec",
            state: "no scratch directory".to_string(),
        })?;

        let working_dir = if config.working_dir.is_empty() {
            root.to_path_buf()
        } else {
            Self::resolve(root, &config.working_dir)
        };

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&config.command)
            .current_dir(working_dir)
            .envs(self.env.iter())
            .envs(config.env.iter());

        let captured = capture::run_unchecked(command, ctx, self.mirror_output).await?;
        Ok(ExecOutput {
            output: captured.output,
            exit_code: captured.status.code().map(i64::from),
        })
    }

    fn kind(&self) -> &'static str {
        "host"
    }
}
