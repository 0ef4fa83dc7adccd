//! Configuration discovery and loading
//!
//! Provider configuration is a TOML document found through this hierarchy:
//! 1. `$TESTRIG_CONFIG` (must exist when set)
//! 2. Current directory: `./testrig.toml` or `./.testrig/config.toml`
//! 3. User config: `~/.testrig/config.toml`
//! 4. System config: `/etc/testrig/config.toml`
//! 5. Built-in defaults
//!
//! ```toml
//! [harnesses.docker]
//! host_socket_path = "/run/user/1000/docker.sock"
//! envs = { CI = "true" }
//!
//! [harnesses.docker.networks.kind]
//! name = "kind"
//!
//! [compose]
//! precedence = "provider"
//!
//! [runner]
//! binary = "tofu"
//! ```

use crate::compose::{Composer, Precedence, ProviderDefaults};
use crate::env;
use crate::error::{HarnessError, Result};
use crate::runner::RunnerConfig;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Harness type sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessesConfig {
    /// `[harnesses.docker]`
    pub docker: ProviderDefaults,
}

/// Composer settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComposeConfig {
    /// Collision policy for networks and registries
    pub precedence: Precedence,
}

/// Top-level provider configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Per harness type defaults
    pub harnesses: HarnessesConfig,
    /// Composer settings
    pub compose: ComposeConfig,
    /// Provisioning tool settings
    pub runner: RunnerConfig,
}

impl ProviderConfig {
    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the document is malformed.
    pub fn from_toml_str(source: &str) -> Result<Self> {
        toml::from_str(source).map_err(|e| HarnessError::config(format!("invalid configuration: {}", e)))
    }

    /// Load from TOML file
    ///
    /// # Errors
    ///
    /// Returns an IO error if the file cannot be read, or
    /// [`HarnessError::Config`] naming the file if it is malformed.
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| std::io::Error::new(e.kind(), format!("{}: {}", path.display(), e)))?;
        toml::from_str(&content)
            .map_err(|e| HarnessError::config(format!("invalid configuration in {}: {}", path.display(), e)))
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if serialization fails.
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| HarnessError::config(format!("cannot render configuration: {}", e)))
    }

    /// A composer over the docker defaults, resolving relative mounts
    /// against `base_dir`.
    pub fn composer(&self, base_dir: impl Into<PathBuf>) -> Composer {
        Composer::new(self.harnesses.docker.clone(), base_dir).with_precedence(self.compose.precedence)
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy.
    ///
    /// # Errors
    ///
    /// Returns an error if `$TESTRIG_CONFIG` names a missing file or the
    /// discovered file cannot be loaded.
    pub fn discover_config() -> Result<(Option<PathBuf>, ProviderConfig)> {
        if let Some(path) = Self::find_config_file()? {
            info!("Loading configuration from: {:?}", path);
            let config = ProviderConfig::from_toml_file(&path)?;
            return Ok((Some(path), config));
        }

        info!("No configuration file found, using defaults");
        Ok((None, ProviderConfig::default()))
    }

    /// Find the first existing configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if `$TESTRIG_CONFIG` is set to a
    /// path that is not a file.
    pub fn find_config_file() -> Result<Option<PathBuf>> {
        if let Some(path) = std::env::var_os(env::CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(HarnessError::config(format!(
                    "{} points at {}, which is not a file",
                    env::CONFIG_ENV_VAR,
                    path.display()
                )));
            }
            return Ok(Some(path));
        }

        for candidate in Self::config_candidates() {
            debug!("Checking for config file: {:?}", candidate);
            if candidate.is_file() {
                debug!("Found config file: {:?}", candidate);
                return Ok(Some(candidate));
            }
        }

        debug!("No config file found in discovery hierarchy");
        Ok(None)
    }

    /// Configuration file candidates in priority order, excluding
    /// `$TESTRIG_CONFIG`.
    pub fn config_candidates() -> Vec<PathBuf> {
        candidates(std::env::current_dir().ok().as_deref(), env::home_dir().as_deref())
    }

    /// Describe the discovery hierarchy and which file is active.
    pub fn discovery_report() -> String {
        let mut report = String::from("Configuration Discovery Hierarchy:\n\n");

        if let Some(path) = std::env::var_os(env::CONFIG_ENV_VAR).filter(|p| !p.is_empty()) {
            let _ = writeln!(report, "  {}={:?}", env::CONFIG_ENV_VAR, path);
        }
        for (i, candidate) in Self::config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "EXISTS"
            } else if candidate.exists() {
                "NOT A FILE"
            } else {
                "NOT FOUND"
            };
            let _ = writeln!(report, "  {}. {:?} - {}", i + 1, candidate, status);
        }

        let active = match Self::find_config_file() {
            Ok(Some(path)) => format!("{:?}", path),
            Ok(None) => "Built-in defaults".to_string(),
            Err(e) => format!("error: {}", e),
        };
        let _ = write!(report, "\nActive configuration: {}", active);
        report
    }
}

fn candidates(current_dir: Option<&Path>, home_dir: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    if let Some(current_dir) = current_dir {
        candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
        candidates.push(env::local_config_file_path(current_dir));
    }

    if let Some(home_dir) = home_dir {
        candidates.push(env::user_config_file_path(home_dir));
    }

    #[cfg(unix)]
    candidates.push(env::system_config_file_path());

    candidates
}
