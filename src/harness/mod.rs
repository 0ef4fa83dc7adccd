//! Harness lifecycle and the runtime abstraction.
//!
//! A harness is an ephemeral execution environment (a container, a VM, or a
//! scratch directory on the host) in which test steps run. Concrete backends
//! implement the [`Runtime`] capability set; [`Harness`] wraps any of them and
//! enforces the lifecycle:
//!
//! ```text
//! Uninitialized -> Starting -> Ready -> (Executing)* -> TearingDown -> Destroyed
//!                     |                                    ^
//!                     +------------- start failed ---------+
//! ```
//!
//! ## Components
//!
//! - [`request`]: validated environment requests
//! - [`archive`]: single-file archive packaging for file injection
//! - [`mount`]: mount descriptors and the volume client boundary
//! - [`registry`]: id-keyed store of live harnesses
//! - [`host`]: scratch-directory backend running commands on the host
//! - [`vm`]: machine backend driven by the provisioning tool
//! - `docker`: container engine backend (requires `containers` feature)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use testrig::harness::{ExecConfig, Harness, HostRuntime};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> testrig::Result<()> {
//!     let ctx = CancellationToken::new();
//!     let mut harness = Harness::new("demo", HostRuntime::new("demo"));
//!
//!     harness.start(&ctx).await?;
//!     let output = harness.exec(&ctx, &ExecConfig::new("echo hello")).await?;
//!     println!("{}", output.text());
//!     harness.teardown(&ctx).await?;
//!     Ok(())
//! }
//! ```

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use std::fmt;
use std::io::Cursor;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub mod archive;
pub mod host;
pub mod mount;
pub mod registry;
pub mod request;
pub mod vm;

#[cfg(feature = "containers")]
pub mod docker;

pub use host::HostRuntime;
pub use mount::{Mount, MountKind, VolumeClient, VolumeRequest};
pub use registry::{HarnessRegistry, SharedHarness};
pub use request::{ContainerRequest, ContainerRequestBuilder, Env, File};
pub use vm::VmRuntime;

#[cfg(feature = "containers")]
pub use docker::DockerRuntime;

/// Grace period granted to the cleanup that follows a failed start.
pub const TEARDOWN_GRACE: Duration = Duration::from_secs(120);

/// One command invocation inside a ready environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecConfig {
    /// Shell command to run
    pub command: String,
    /// Working directory (empty for the backend default)
    pub working_dir: String,
    /// Extra environment variables
    pub env: Env,
    /// First variable [`with_env`](Self::with_env) refused
    rejected: Option<String>,
}

impl ExecConfig {
    /// Run `command` in the backend's default working directory.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Add an environment variable.
    ///
    /// A malformed key is remembered and reported by
    /// [`validate`](Self::validate), which [`Harness::exec`] runs first.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        if let Err(e) = self.env.set(key, value) {
            self.rejected.get_or_insert_with(|| e.to_string());
        }
        self
    }

    /// Check that every variable passed to [`with_env`](Self::with_env) was
    /// accepted.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] naming the first refused key.
    pub fn validate(&self) -> Result<()> {
        match &self.rejected {
            Some(reason) => Err(HarnessError::config(format!(
                "invalid exec environment: {}",
                reason
            ))),
            None => Ok(()),
        }
    }
}

/// Combined output of a command run inside a harness.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Interleaved stdout and stderr bytes
    pub output: Vec<u8>,
    /// Exit code, if one was reported
    pub exit_code: Option<i64>,
}

impl ExecOutput {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// A reader over the captured bytes.
    pub fn reader(&self) -> Cursor<&[u8]> {
        Cursor::new(self.output.as_slice())
    }

    /// Captured output as lossy UTF-8.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

/// Capability set every harness backend implements.
///
/// Backends are not required to tolerate concurrent calls; [`Harness`] holds
/// them behind `&mut self` and the registry serializes access per id.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Bring the environment to a ready state.
    async fn start(&mut self, ctx: &CancellationToken) -> Result<()>;

    /// Release everything `start` created.
    ///
    /// Must be safe to call after a partial or failed `start`.
    async fn teardown(&mut self, ctx: &CancellationToken) -> Result<()>;

    /// Run a command inside the ready environment, blocking until it
    /// completes or `ctx` is cancelled.
    async fn exec(&mut self, ctx: &CancellationToken, config: &ExecConfig) -> Result<ExecOutput>;

    /// Backend type name for logging.
    fn kind(&self) -> &'static str;
}

/// Lifecycle state of a harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarnessState {
    /// Created, not started
    Uninitialized,
    /// `start` in progress
    Starting,
    /// Ready to execute commands
    Ready,
    /// A command is running
    Executing,
    /// `teardown` in progress or failed
    TearingDown,
    /// All resources released
    Destroyed,
}

impl fmt::Display for HarnessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HarnessState::Uninitialized => "uninitialized",
            HarnessState::Starting => "starting",
            HarnessState::Ready => "ready",
            HarnessState::Executing => "executing",
            HarnessState::TearingDown => "tearing down",
            HarnessState::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// A runtime backend bound to a harness id and its lifecycle state.
pub struct Harness {
    id: String,
    state: HarnessState,
    runtime: Box<dyn Runtime>,
}

impl fmt::Debug for Harness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Harness")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("kind", &self.runtime.kind())
            .finish()
    }
}

impl Harness {
    /// Wrap a backend.
    pub fn new(id: impl Into<String>, runtime: impl Runtime + 'static) -> Self {
        Self::from_boxed(id, Box::new(runtime))
    }

    /// Wrap an already boxed backend.
    pub fn from_boxed(id: impl Into<String>, runtime: Box<dyn Runtime>) -> Self {
        Self {
            id: id.into(),
            state: HarnessState::Uninitialized,
            runtime,
        }
    }

    /// Harness id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> HarnessState {
        self.state
    }

    /// Backend type name.
    pub fn kind(&self) -> &'static str {
        self.runtime.kind()
    }

    fn invalid(&self, operation: &'static str) -> HarnessError {
        HarnessError::InvalidState {
            operation,
            state: self.state.to_string(),
        }
    }

    /// Start the environment.
    ///
    /// On failure a best-effort teardown runs under a fresh
    /// [`TEARDOWN_GRACE`] deadline; its error is logged and the start error
    /// is returned.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] unless uninitialized, otherwise
    /// whatever the backend's `start` returned.
    pub async fn start(&mut self, ctx: &CancellationToken) -> Result<()> {
        if self.state != HarnessState::Uninitialized {
            return Err(self.invalid("start"));
        }

        info!("Starting {} harness {}", self.kind(), self.id);
        self.state = HarnessState::Starting;

        match self.runtime.start(ctx).await {
            Ok(()) => {
                self.state = HarnessState::Ready;
                info!("Harness {} is ready", self.id);
                Ok(())
            }
            Err(e) => {
                warn!("Harness {} failed to start: {}", self.id, e);
                self.state = HarnessState::TearingDown;

                let cleanup = deadline(&CancellationToken::new(), TEARDOWN_GRACE);
                if let Err(teardown_err) = self.runtime.teardown(&cleanup).await {
                    warn!(
                        harness_id = %self.id,
                        "Cleanup after failed start also failed: {}", teardown_err
                    );
                }
                cleanup.cancel();

                self.state = HarnessState::Destroyed;
                Err(e)
            }
        }
    }

    /// Run a command inside the ready environment.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] unless ready,
    /// [`HarnessError::Cancelled`] if `ctx` is cancelled mid-run, otherwise
    /// whatever the backend's `exec` returned.
    pub async fn exec(&mut self, ctx: &CancellationToken, config: &ExecConfig) -> Result<ExecOutput> {
        if self.state != HarnessState::Ready {
            return Err(self.invalid("exec"));
        }
        config.validate()?;

        debug!("Executing in harness {}: {}", self.id, config.command);
        self.state = HarnessState::Executing;
        let result = self.runtime.exec(ctx, config).await;
        self.state = HarnessState::Ready;
        result
    }

    /// Release every resource the harness holds.
    ///
    /// Tearing down an uninitialized or destroyed harness succeeds without
    /// touching the backend. A failed teardown leaves the harness in
    /// [`HarnessState::TearingDown`] so it can be retried.
    ///
    /// # Errors
    ///
    /// Returns whatever the backend's `teardown` returned.
    pub async fn teardown(&mut self, ctx: &CancellationToken) -> Result<()> {
        match self.state {
            HarnessState::Destroyed => return Ok(()),
            HarnessState::Uninitialized => {
                self.state = HarnessState::Destroyed;
                return Ok(());
            }
            // Starting/Executing are only observable here when the future
            // driving that operation was dropped; cleanup is still allowed.
            HarnessState::Starting
            | HarnessState::Executing
            | HarnessState::Ready
            | HarnessState::TearingDown => {}
        }

        info!("Tearing down harness {}", self.id);
        self.state = HarnessState::TearingDown;
        self.runtime.teardown(ctx).await?;
        self.state = HarnessState::Destroyed;
        info!("Harness {} destroyed", self.id);
        Ok(())
    }
}

/// Derive a token that is cancelled with `parent` or after `timeout`,
/// whichever comes first.
///
/// Must be called from within a tokio runtime.
pub fn deadline(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
    let token = parent.child_token();
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(timeout) => timer.cancel(),
            _ = timer.cancelled() => {}
        }
    });
    token
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Calls {
        log: Mutex<Vec<&'static str>>,
    }

    impl Calls {
        fn push(&self, call: &'static str) {
            self.log.lock().unwrap().push(call);
        }

        fn snapshot(&self) -> Vec<&'static str> {
            self.log.lock().unwrap().clone()
        }
    }

    struct Scripted {
        calls: Arc<Calls>,
        fail_start: bool,
        fail_teardown: bool,
    }

    #[async_trait]
    impl Runtime for Scripted {
        async fn start(&mut self, _ctx: &CancellationToken) -> Result<()> {
            self.calls.push("start");
            if self.fail_start {
                return Err(HarnessError::backend("image pull failed"));
            }
            Ok(())
        }

        async fn teardown(&mut self, _ctx: &CancellationToken) -> Result<()> {
            self.calls.push("teardown");
            if self.fail_teardown {
                return Err(HarnessError::backend("container busy"));
            }
            Ok(())
        }

        async fn exec(&mut self, _ctx: &CancellationToken, config: &ExecConfig) -> Result<ExecOutput> {
            self.calls.push("exec");
            Ok(ExecOutput {
                output: config.command.clone().into_bytes(),
                exit_code: Some(0),
            })
        }

        fn kind(&self) -> &'static str {
            "scripted"
        }
    }

    fn scripted(fail_start: bool, fail_teardown: bool) -> (Harness, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        let runtime = Scripted {
            calls: calls.clone(),
            fail_start,
            fail_teardown,
        };
        (Harness::new("h1", runtime), calls)
    }

    #[tokio::test]
    async fn test_exec_rejects_malformed_env_key() {
        let ctx = CancellationToken::new();
        let (mut harness, calls) = scripted(false, false);
        harness.start(&ctx).await.unwrap();

        let config = ExecConfig::new("true").with_env("X=1; echo INJECTED; Y", "v");
        let err = harness.exec(&ctx, &config).await.unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)), "{}", err);
        assert!(err.to_string().contains("X=1; echo INJECTED; Y"));
        assert!(config.env.is_empty());
        assert_eq!(harness.state(), HarnessState::Ready);
        assert_eq!(calls.snapshot(), vec!["start"]);
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let ctx = CancellationToken::new();
        let (mut harness, calls) = scripted(false, false);
        assert_eq!(harness.state(), HarnessState::Uninitialized);

        harness.start(&ctx).await.unwrap();
        assert_eq!(harness.state(), HarnessState::Ready);

        let output = harness.exec(&ctx, &ExecConfig::new("echo hi")).await.unwrap();
        assert_eq!(output.text(), "echo hi");
        assert!(output.success());
        assert_eq!(harness.state(), HarnessState::Ready);

        harness.teardown(&ctx).await.unwrap();
        assert_eq!(harness.state(), HarnessState::Destroyed);
        assert_eq!(calls.snapshot(), vec!["start", "exec", "teardown"]);
    }

    #[tokio::test]
    async fn test_exec_before_start_is_invalid() {
        let ctx = CancellationToken::new();
        let (mut harness, calls) = scripted(false, false);

        let err = harness.exec(&ctx, &ExecConfig::new("true")).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { operation: "exec", .. }));
        assert!(calls.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_exec_after_teardown_is_invalid() {
        let ctx = CancellationToken::new();
        let (mut harness, _) = scripted(false, false);
        harness.start(&ctx).await.unwrap();
        harness.teardown(&ctx).await.unwrap();

        let err = harness.exec(&ctx, &ExecConfig::new("true")).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_failed_start_tears_down() {
        let ctx = CancellationToken::new();
        let (mut harness, calls) = scripted(true, false);

        let err = harness.start(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("image pull failed"));
        assert_eq!(harness.state(), HarnessState::Destroyed);
        assert_eq!(calls.snapshot(), vec!["start", "teardown"]);
    }

    #[tokio::test]
    async fn test_teardown_error_does_not_mask_start_error() {
        let ctx = CancellationToken::new();
        let (mut harness, _) = scripted(true, true);

        let err = harness.start(&ctx).await.unwrap_err();
        assert!(err.to_string().contains("image pull failed"));
        assert_eq!(harness.state(), HarnessState::Destroyed);
    }

    #[tokio::test]
    async fn test_teardown_is_idempotent() {
        let ctx = CancellationToken::new();
        let (mut harness, calls) = scripted(false, false);
        harness.start(&ctx).await.unwrap();

        harness.teardown(&ctx).await.unwrap();
        harness.teardown(&ctx).await.unwrap();
        assert_eq!(calls.snapshot(), vec!["start", "teardown"]);
    }

    #[tokio::test]
    async fn test_failed_teardown_can_be_retried() {
        let ctx = CancellationToken::new();
        let (mut harness, _) = scripted(false, true);
        harness.start(&ctx).await.unwrap();

        assert!(harness.teardown(&ctx).await.is_err());
        assert_eq!(harness.state(), HarnessState::TearingDown);
        assert!(harness.teardown(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid() {
        let ctx = CancellationToken::new();
        let (mut harness, _) = scripted(false, false);
        harness.start(&ctx).await.unwrap();

        let err = harness.start(&ctx).await.unwrap_err();
        assert!(matches!(err, HarnessError::InvalidState { operation: "start", .. }));
    }

    #[tokio::test]
    async fn test_deadline_cancels() {
        let parent = CancellationToken::new();
        let token = deadline(&parent, Duration::from_millis(20));

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .expect("deadline should fire");
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn test_deadline_follows_parent() {
        let parent = CancellationToken::new();
        let token = deadline(&parent, Duration::from_secs(3600));
        parent.cancel();
        assert!(token.is_cancelled());
    }
}
