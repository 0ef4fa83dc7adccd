//! # testrig
//!
//! Provisions ephemeral test harnesses (containers, VMs, or scratch
//! directories on the host), runs test steps inside them, and tears them down.
//!
//! ## Architecture Overview
//!
//! - **[`harness`]**: the runtime abstraction, lifecycle state machine,
//!   environment requests, file packaging, and the harness registry
//! - **[`compose`]**: layered configuration merge producing a validated
//!   harness description
//! - **[`container`]**: container engine plumbing over bollard (feature
//!   `containers`)
//! - **[`runner`]**: drives the provisioning tool (`terraform` or a compatible
//!   binary) in a staged working directory
//! - **[`config`]**: provider configuration discovery and loading
//! - **[`env`]**: reserved names, default labels, and configuration paths
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use testrig::harness::{ExecConfig, Harness, HarnessRegistry, HostRuntime};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> testrig::Result<()> {
//!     let ctx = CancellationToken::new();
//!     let registry = HarnessRegistry::new();
//!
//!     let harness = Harness::new("smoke", HostRuntime::new("smoke"));
//!     registry.setup(harness, &ctx).await?;
//!
//!     let output = registry
//!         .exec("smoke", &ctx, &ExecConfig::new("echo hello"))
//!         .await?;
//!     println!("{}", output.text());
//!
//!     registry.teardown("smoke", &ctx).await?;
//!     Ok(())
//! }
//! ```

/// Error taxonomy shared by every layer.
pub mod error;

/// Environment constants and path utilities.
///
/// Centralizes reserved names, default labels, and configuration paths so
/// every created resource carries the same provenance markers.
pub mod env;

/// Provider configuration discovery and loading.
pub mod config;

/// Runtime abstraction and harness lifecycle.
pub mod harness;

/// Layered configuration merge.
pub mod compose;

/// External provisioning tool runner.
pub mod runner;

/// Container engine integration.
#[cfg(feature = "containers")]
pub mod container;

// CLI module for command-line interface
pub mod cli;

pub use config::{ConfigDiscovery, ProviderConfig};
pub use error::{HarnessError, Result};
pub use harness::{ExecConfig, ExecOutput, Harness, HarnessRegistry, HarnessState, Runtime};
