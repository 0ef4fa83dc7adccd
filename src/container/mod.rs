//! Container engine plumbing.
//!
//! Talks to Docker or Podman through the bollard API. Compiled with the
//! `containers` feature.
//!
//! ## Components
//!
//! - [`client`]: connection handling with socket fallbacks
//! - [`config`]: create-container bodies built from a composed harness
//! - [`executor`]: command execution with combined output capture
//! - [`orchestrator`]: pull, create, connect, upload, start, stop, remove
//! - [`volume`]: the engine-backed [`VolumeClient`](crate::harness::VolumeClient)
//!
//! ## Usage
//!
//! ```rust,no_run
//! use testrig::container::ContainerOrchestrator;
//! use testrig::harness::{VolumeClient, VolumeRequest};
//!
//! #[tokio::main]
//! async fn main() -> testrig::Result<()> {
//!     let orchestrator = ContainerOrchestrator::new().await?;
//!     let volumes = orchestrator.volumes();
//!
//!     let mount = volumes
//!         .create_volume(&VolumeRequest::named("scratch", "/scratch"))
//!         .await?;
//!     volumes.remove_volume(&mount).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod executor;
pub mod orchestrator;
pub mod volume;

pub use client::{ContainerClient, ContainerClientConfig};
pub use config::{ContainerConfig, ContainerConfigBuilder};
pub use orchestrator::{ContainerOrchestrator, ContainerOrchestratorConfig, docker_credentials};
pub use volume::VolumeManager;
