//! Command line interface for the `testrig` binary
//!
//! Argument parsing lives here so it can be unit tested; `main.rs` only
//! dispatches on the resulting [`ExecutionMode`].

pub mod args;

pub use args::{Args, ExecutionMode, HarnessKind, RunConfig, TerraformConfig};
