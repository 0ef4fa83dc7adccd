//! Command line argument parsing
//!
//! Subcommands:
//! - `run`: compose a harness from a spec file, run one command, tear down
//! - `terraform`: apply a template directory and print its outputs
//! - `show-config`: show configuration discovery information

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, PartialEq, Eq)]
pub enum ExecutionMode {
    Run(RunConfig),
    Terraform(TerraformConfig),
    ShowConfig,
}

/// Backend a `run` harness is provisioned on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum HarnessKind {
    /// Container engine
    #[default]
    Docker,
    /// Scratch directory on this machine
    Host,
}

#[derive(Debug, PartialEq, Eq)]
pub struct RunConfig {
    pub spec: PathBuf,
    pub kind: HarnessKind,
    pub config_override: Option<PathBuf>,
    pub working_dir: Option<String>,
    pub command: String,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TerraformConfig {
    pub dir: PathBuf,
    pub config_override: Option<PathBuf>,
    pub destroy: bool,
}

#[derive(Debug, Parser)]
#[command(name = "testrig")]
#[command(author = "Testrig Team")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Provisions ephemeral container and VM harnesses for running test steps")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Provision a harness, run one command in it, then tear it down
    Run {
        /// Harness spec (TOML)
        #[arg(short = 's', long = "spec")]
        spec: PathBuf,
        /// Backend to provision
        #[arg(short = 'k', long = "kind", value_enum, default_value_t = HarnessKind::Docker)]
        kind: HarnessKind,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Working directory inside the harness
        #[arg(short = 'w', long = "workdir")]
        workdir: Option<String>,
        /// Command to run, after `--`
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Apply a template directory and print its outputs as JSON
    Terraform {
        /// Template directory
        dir: PathBuf,
        /// Configuration file path
        #[arg(short = 'c', long = "config")]
        config: Option<PathBuf>,
        /// Destroy the resources after printing the outputs
        #[arg(long = "destroy")]
        destroy: bool,
    },
    /// Show configuration discovery information
    #[command(name = "config", alias = "show-config")]
    ShowConfig,
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    pub fn mode(&self) -> Result<ExecutionMode, String> {
        match &self.command {
            Some(Commands::Run {
                spec,
                kind,
                config,
                workdir,
                command,
            }) => Ok(ExecutionMode::Run(RunConfig {
                spec: spec.clone(),
                kind: *kind,
                config_override: config.clone(),
                working_dir: workdir.clone(),
                command: command.join(" "),
            })),
            Some(Commands::Terraform {
                dir,
                config,
                destroy,
            }) => Ok(ExecutionMode::Terraform(TerraformConfig {
                dir: dir.clone(),
                config_override: config.clone(),
                destroy: *destroy,
            })),
            Some(Commands::ShowConfig) => Ok(ExecutionMode::ShowConfig),
            None => Err(
                "No command specified. Use 'testrig --help' to see available commands."
                    .to_string(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(argv: &[&str]) -> ExecutionMode {
        Args::try_parse_from(argv).unwrap().mode().unwrap()
    }

    #[test]
    fn test_run_command() {
        let mode = mode(&[
            "testrig", "run", "--spec", "h.toml", "--kind", "host", "--", "echo", "hi mom",
        ]);
        assert_eq!(
            mode,
            ExecutionMode::Run(RunConfig {
                spec: PathBuf::from("h.toml"),
                kind: HarnessKind::Host,
                config_override: None,
                working_dir: None,
                command: "echo hi mom".to_string(),
            })
        );
    }

    #[test]
    fn test_run_defaults_to_docker() {
        let ExecutionMode::Run(config) = mode(&["testrig", "run", "-s", "h.toml", "--", "true"]) else {
            panic!("expected run mode");
        };
        assert_eq!(config.kind, HarnessKind::Docker);
    }

    #[test]
    fn test_run_requires_command() {
        assert!(Args::try_parse_from(["testrig", "run", "--spec", "h.toml"]).is_err());
    }

    #[test]
    fn test_terraform_command() {
        let mode = mode(&["testrig", "terraform", "infra/vm", "--destroy", "-c", "ci.toml"]);
        assert_eq!(
            mode,
            ExecutionMode::Terraform(TerraformConfig {
                dir: PathBuf::from("infra/vm"),
                config_override: Some(PathBuf::from("ci.toml")),
                destroy: true,
            })
        );
    }

    #[test]
    fn test_show_config() {
        assert_eq!(mode(&["testrig", "config"]), ExecutionMode::ShowConfig);
        assert_eq!(mode(&["testrig", "show-config"]), ExecutionMode::ShowConfig);
    }
}
