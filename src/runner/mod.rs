//! # External Process Runner
//!
//! Drives an infrastructure provisioning tool (terraform or a compatible
//! binary) as a subprocess against a reproducible working tree.
//!
//! ## Protocol
//!
//! ```text
//! template dir ──stage──▶ ephemeral working dir
//!                               │
//!                   init ─▶ apply ─▶ output -json
//!                               │
//!                            destroy
//! ```
//!
//! Every subcommand runs in the staged working directory, inherits this
//! process's environment, and has its stdout and stderr captured by
//! [`capture::run`]. A failed subcommand yields
//! [`HarnessError::Process`] carrying the full combined output; cancelling
//! the context kills the subprocess and yields [`HarnessError::Cancelled`].
//! `output -json` is parsed from stdout alone, so warnings the tool prints on
//! stderr never reach the JSON parser.
//!
//! The working directory is left on disk after the run. Removing it belongs
//! to whoever owns the [`ProcessSession`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use testrig::runner::Terraform;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> testrig::Result<()> {
//!     let ctx = CancellationToken::new();
//!     let mut tf = Terraform::new("./templates/vm");
//!
//!     let outputs = tf.apply(&ctx).await?;
//!     println!("{:?}", outputs.get("address"));
//!
//!     tf.destroy(&ctx).await
//! }
//! ```

use crate::env;
use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod capture;
pub mod stage;

pub use capture::Captured;

/// Provisioning tool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Tool binary name or path (default: "terraform")
    #[serde(default = "default_binary")]
    pub binary: String,

    /// Global arguments placed before every subcommand
    #[serde(default)]
    pub global_args: Vec<String>,

    /// Mirror subprocess output to the console while capturing it
    #[serde(default = "default_mirror_output")]
    pub mirror_output: bool,

    /// Extra environment variables on top of the inherited environment
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_binary() -> String {
    env::runner::DEFAULT_TOOL.to_string()
}

fn default_mirror_output() -> bool {
    true
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            binary: default_binary(),
            global_args: Vec::new(),
            mirror_output: default_mirror_output(),
            env: BTreeMap::new(),
        }
    }
}

/// One output value reported by `output -json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    /// Output value
    pub value: serde_json::Value,
    /// Type descriptor as reported by the tool
    #[serde(rename = "type", default)]
    pub kind: serde_json::Value,
    /// Whether the tool marked the value sensitive
    #[serde(default)]
    pub sensitive: bool,
}

/// Outputs keyed by name.
pub type Outputs = BTreeMap<String, OutputValue>;

/// A staged copy of the template tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSession {
    working_dir: PathBuf,
    source: PathBuf,
    files: usize,
}

impl ProcessSession {
    /// Working directory all subcommands run in.
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Template tree the session was staged from.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Number of files staged.
    pub fn files(&self) -> usize {
        self.files
    }
}

/// Provisioning tool runner bound to one template tree.
#[derive(Debug, Clone)]
pub struct Terraform {
    source: PathBuf,
    config: RunnerConfig,
    session: Option<ProcessSession>,
}

impl Terraform {
    /// Create a runner for `source` with default settings.
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self::with_config(source, RunnerConfig::default())
    }

    /// Create a runner with custom settings.
    pub fn with_config(source: impl Into<PathBuf>, config: RunnerConfig) -> Self {
        Self {
            source: source.into(),
            config,
            session: None,
        }
    }

    /// The staged session, if [`stage`](Self::stage) has run.
    pub fn session(&self) -> Option<&ProcessSession> {
        self.session.as_ref()
    }

    /// Runner settings.
    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Copy the template tree into a fresh ephemeral working directory.
    ///
    /// Staging again replaces the previous session; the old directory is
    /// left on disk.
    ///
    /// # Errors
    ///
    /// Returns an IO error if the directory cannot be created or the copy
    /// fails.
    pub async fn stage(&mut self) -> Result<&ProcessSession> {
        let source = self.source.clone();
        let session = tokio::task::spawn_blocking(move || -> Result<ProcessSession> {
            let working_dir = tempfile::Builder::new()
                .prefix(env::runner::WORKDIR_PREFIX)
                .tempdir()?
                .keep();
            let files = stage::copy_tree(&source, &working_dir)?;
            Ok(ProcessSession {
                working_dir,
                source,
                files,
            })
        })
        .await
        .map_err(|e| HarnessError::backend(format!("staging task failed: {}", e)))??;

        info!(
            "Staged {} files from {} into {}",
            session.files,
            session.source.display(),
            session.working_dir.display()
        );
        Ok(self.session.insert(session))
    }

    /// Run `init -input=false`.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] if nothing is staged, otherwise
    /// any subprocess error.
    pub async fn init(&self, ctx: &CancellationToken) -> Result<Vec<u8>> {
        Ok(self.run(ctx, &["init", "-input=false"]).await?.output)
    }

    /// Stage (if needed), init, apply, and read back the outputs.
    ///
    /// # Errors
    ///
    /// Returns the first failing step's error.
    pub async fn apply(&mut self, ctx: &CancellationToken) -> Result<Outputs> {
        if self.session.is_none() {
            self.stage().await?;
        }

        self.init(ctx).await?;
        self.run(ctx, &["apply", "-auto-approve", "-input=false"])
            .await?;
        self.output(ctx).await
    }

    /// Run `destroy -auto-approve -input=false` in the staged session.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] if nothing was staged,
    /// otherwise any subprocess error.
    pub async fn destroy(&self, ctx: &CancellationToken) -> Result<()> {
        self.run(ctx, &["destroy", "-auto-approve", "-input=false"])
            .await?;
        Ok(())
    }

    /// Run `output -json` and parse its stdout.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if the output is not the expected
    /// JSON object, otherwise any subprocess error.
    pub async fn output(&self, ctx: &CancellationToken) -> Result<Outputs> {
        let captured = self.run(ctx, &["output", "-json"]).await?;
        serde_json::from_slice(&captured.stdout).map_err(|e| {
            HarnessError::backend(format!(
                "unparseable `output -json` result: {}\n{}",
                e,
                String::from_utf8_lossy(&captured.output)
            ))
        })
    }

    async fn run(&self, ctx: &CancellationToken, args: &[&str]) -> Result<Captured> {
        let session = self.session.as_ref().ok_or_else(|| HarnessError::InvalidState {
            operation: "run the provisioning tool",
            state: "unstaged".to_string(),
        })?;

        let binary = which::which(&self.config.binary).map_err(|e| {
            HarnessError::config(format!(
                "provisioning tool {:?} not found: {}",
                self.config.binary, e
            ))
        })?;

        let mut command = Command::new(binary);
        command
            .args(&self.config.global_args)
            .args(args)
            .current_dir(&session.working_dir)
            .envs(&self.config.env);

        info!("Running {} {}", self.config.binary, args.join(" "));
        capture::run(command, ctx, self.config.mirror_output).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    const FAKE_TOOL: &str = r#"
case "$1" in
  init) echo "Initializing the backend..." ;;
  apply) echo "Apply complete!"; touch applied ;;
  destroy) rm -f applied; echo "Destroy complete!" ;;
  output) printf '{"example":{"sensitive":false,"type":"string","value":"hi mom"}}' ;;
  *) echo "unknown subcommand $1" 1>&2; exit 1 ;;
esac
"#;

    struct Fixture {
        _tools: tempfile::TempDir,
        template: tempfile::TempDir,
        config: RunnerConfig,
    }

    fn fixture(script: &str) -> Fixture {
        let tools = tempfile::tempdir().unwrap();
        let script_path = tools.path().join("fake-tf.sh");
        fs::write(&script_path, script).unwrap();

        let template = tempfile::tempdir().unwrap();
        fs::write(template.path().join("main.tf"), "output \"example\" {}").unwrap();

        let config = RunnerConfig {
            binary: "sh".to_string(),
            global_args: vec![script_path.to_string_lossy().into_owned()],
            mirror_output: false,
            env: BTreeMap::new(),
        };

        Fixture {
            _tools: tools,
            template,
            config,
        }
    }

    #[tokio::test]
    async fn test_apply_stages_and_reads_outputs() {
        let ctx = CancellationToken::new();
        let fx = fixture(FAKE_TOOL);
        let mut tf = Terraform::with_config(fx.template.path(), fx.config.clone());

        let outputs = tf.apply(&ctx).await.unwrap();
        assert_eq!(outputs["example"].value, serde_json::json!("hi mom"));
        assert!(!outputs["example"].sensitive);

        let session = tf.session().unwrap();
        assert_ne!(session.working_dir(), fx.template.path());
        assert!(session.working_dir().join("main.tf").exists());
        assert!(session.working_dir().join("applied").exists());
        assert!(!fx.template.path().join("applied").exists());

        tf.destroy(&ctx).await.unwrap();
        assert!(!session.working_dir().join("applied").exists());
        fs::remove_dir_all(session.working_dir()).unwrap();
    }

    #[tokio::test]
    async fn test_destroy_requires_session() {
        let ctx = CancellationToken::new();
        let fx = fixture(FAKE_TOOL);
        let tf = Terraform::with_config(fx.template.path(), fx.config.clone());

        let err = tf.destroy(&ctx).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_failed_apply_surfaces_output() {
        let ctx = CancellationToken::new();
        let fx = fixture("case \"$1\" in init) exit 0 ;; *) echo 'Error: quota exceeded' 1>&2; exit 1 ;; esac");
        let mut tf = Terraform::with_config(fx.template.path(), fx.config.clone());

        let err = tf.apply(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("apply -auto-approve -input=false"));
        assert_eq!(err.output(), Some("Error: quota exceeded\n"));
    }

    #[tokio::test]
    async fn test_missing_tool_is_config_error() {
        let ctx = CancellationToken::new();
        let fx = fixture(FAKE_TOOL);
        let config = RunnerConfig {
            binary: "testrig-no-such-provisioner".to_string(),
            ..fx.config.clone()
        };
        let mut tf = Terraform::with_config(fx.template.path(), config);

        let err = tf.apply(&ctx).await.unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert!(err.to_string().contains("testrig-no-such-provisioner"));
    }

    #[tokio::test]
    async fn test_unparseable_output() {
        let ctx = CancellationToken::new();
        let fx = fixture("echo 'not json'");
        let mut tf = Terraform::with_config(fx.template.path(), fx.config.clone());
        tf.stage().await.unwrap();

        let err = tf.output(&ctx).await.unwrap_err();
        assert!(matches!(err, HarnessError::Backend { .. }));
        assert!(err.to_string().contains("not json"));
    }

    #[tokio::test]
    async fn test_stderr_warnings_do_not_break_outputs() {
        let ctx = CancellationToken::new();
        let script = r#"
case "$1" in
  output)
    echo 'Warning: provider deprecated' 1>&2
    printf '{"example":{"sensitive":false,"type":"string","value":"hi mom"}}'
    echo 'Warning: provider deprecated' 1>&2 ;;
  *) echo "$1 complete"; echo "Warning: $1 is slow" 1>&2 ;;
esac
"#;
        let fx = fixture(script);
        let mut tf = Terraform::with_config(fx.template.path(), fx.config.clone());

        let outputs = tf.apply(&ctx).await.unwrap();
        assert_eq!(outputs["example"].value, serde_json::json!("hi mom"));
        fs::remove_dir_all(tf.session().unwrap().working_dir()).unwrap();
    }

    #[tokio::test]
    async fn test_runner_env_is_passed() {
        let ctx = CancellationToken::new();
        let fx = fixture("printf '{\"region\":{\"value\":\"%s\",\"type\":\"string\"}}' \"$TF_VAR_region\"");
        let mut config = fx.config.clone();
        config.env.insert("TF_VAR_region".to_string(), "us-central1".to_string());
        let mut tf = Terraform::with_config(fx.template.path(), config);
        tf.stage().await.unwrap();

        let outputs = tf.output(&ctx).await.unwrap();
        assert_eq!(outputs["region"].value, serde_json::json!("us-central1"));
    }

    #[test]
    fn test_runner_config_defaults() {
        let config: RunnerConfig = toml::from_str("").unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.binary, "terraform");
        assert!(config.mirror_output);
    }
}
