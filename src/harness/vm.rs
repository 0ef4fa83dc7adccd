//! Machine backend driven by the provisioning tool.
//!
//! `start` applies the template, `teardown` destroys it. Commands reach the
//! machine through the `exec_prefix` output the template publishes, typically
//! an ssh invocation such as `["ssh", "-o", "BatchMode=yes", "user@host"]`.
//! The command is wrapped as a single `sh -c '<script>'` argument so the
//! remote side sees it verbatim.

use crate::env;
use crate::error::{HarnessError, Result};
use crate::harness::{ExecConfig, ExecOutput, Runtime};
use crate::runner::{Outputs, Terraform, capture};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;
use std::sync::LazyLock;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static SHELL_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static shell name pattern compiles"));

/// Provisioning-tool backed machine.
#[derive(Debug)]
pub struct VmRuntime {
    id: String,
    terraform: Terraform,
    outputs: Outputs,
}

impl VmRuntime {
    /// Create a backend for harness `id` over a template runner.
    pub fn new(id: impl Into<String>, terraform: Terraform) -> Self {
        Self {
            id: id.into(),
            terraform,
            outputs: Outputs::new(),
        }
    }

    /// Outputs reported by the last apply.
    pub fn outputs(&self) -> &Outputs {
        &self.outputs
    }

    /// The underlying runner.
    pub fn terraform(&self) -> &Terraform {
        &self.terraform
    }

    fn exec_prefix(&self) -> Result<Vec<String>> {
        let name = env::runner::EXEC_PREFIX_OUTPUT;
        let output = self.outputs.get(name).ok_or_else(|| {
            HarnessError::config(format!(
                "template for harness {} has no {:?} output",
                self.id, name
            ))
        })?;

        let prefix: Vec<String> = match &output.value {
            Value::Array(items) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_string).ok_or_else(|| {
                        HarnessError::config(format!("{:?} must contain only strings", name))
                    })
                })
                .collect::<Result<_>>()?,
            Value::String(line) => line.split_whitespace().map(str::to_string).collect(),
            other => {
                return Err(HarnessError::config(format!(
                    "{:?} must be a list of strings, got {}",
                    name, other
                )));
            }
        };

        if prefix.is_empty() {
            return Err(HarnessError::config(format!("{:?} is empty", name)));
        }
        Ok(prefix)
    }
}

/// Render an exec request as one `sh -c` argument.
///
/// Variable names are spliced into the script unquoted, so they must be
/// shell identifiers.
fn remote_script(config: &ExecConfig) -> Result<String> {
    let mut script = String::new();
    for (key, value) in config.env.iter() {
        if !SHELL_NAME.is_match(key) {
            return Err(HarnessError::config(format!(
                "environment variable {:?} is not a valid shell name",
                key
            )));
        }
        script.push_str(&format!("export {}={}; ", key, quote(value)));
    }
    if !config.working_dir.is_empty() {
        script.push_str(&format!("cd {} && ", quote(&config.working_dir)));
    }
    script.push_str(&config.command);
    Ok(format!("sh -c {}", quote(&script)))
}

fn quote(value: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(value))
}

#[async_trait]
impl Runtime for VmRuntime {
    async fn start(&mut self, ctx: &CancellationToken) -> Result<()> {
        self.outputs = self.terraform.apply(ctx).await?;
        info!(
            "Machine harness {} applied with outputs {:?}",
            self.id,
            self.outputs.keys().collect::<Vec<_>>()
        );
        Ok(())
    }

    async fn teardown(&mut self, ctx: &CancellationToken) -> Result<()> {
        if self.terraform.session().is_none() {
            debug!("Machine harness {} was never staged, nothing to destroy", self.id);
            return Ok(());
        }
        self.terraform.destroy(ctx).await
    }

    async fn exec(&mut self, ctx: &CancellationToken, config: &ExecConfig) -> Result<ExecOutput> {
        let prefix = self.exec_prefix()?;
        let (program, args) = prefix.split_first().ok_or_else(|| {
            HarnessError::config(format!("{:?} is empty", env::runner::EXEC_PREFIX_OUTPUT))
        })?;

        let mut command = Command::new(program);
        command.args(args).arg(remote_script(config)?);

        let mirror = self.terraform.config().mirror_output;
        let captured = capture::run_unchecked(command, ctx, mirror).await?;
        Ok(ExecOutput {
            output: captured.output,
            exit_code: captured.status.code().map(i64::from),
        })
    }

    fn kind(&self) -> &'static str {
        "vm"
    }
}
