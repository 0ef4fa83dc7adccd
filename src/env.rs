//! Environment constants and path utilities.
//!
//! Centralizes the reserved names, default labels, and configuration paths
//! used throughout the crate so every created resource carries the same
//! provenance markers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Main application directory name (hidden directory like .git, .vscode)
pub const TESTRIG_DIR_NAME: &str = ".testrig";

/// Configuration file name inside [`TESTRIG_DIR_NAME`]
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Configuration file name looked up in the current directory
pub const LOCAL_CONFIG_FILE_NAME: &str = "testrig.toml";

/// Environment variable pointing at an explicit configuration file
pub const CONFIG_ENV_VAR: &str = "TESTRIG_CONFIG";

/// Label keys attached to every resource this crate creates
pub mod labels {
    /// Marks a resource as managed by testrig
    pub const MANAGED: &str = "dev.testrig.managed";

    /// Version of the crate that created the resource
    pub const VERSION: &str = "dev.testrig.version";

    /// Harness a container belongs to
    pub const HARNESS_ID: &str = "dev.testrig.harness.id";
}

/// Harness defaults and reserved names
pub mod harness {
    /// Default image for docker harnesses
    pub const DEFAULT_DOCKER_IMAGE: &str = "cgr.dev/chainguard/docker-cli:latest-dev";

    /// Suffix of the per-harness config volume name
    pub const CONFIG_VOLUME_SUFFIX: &str = "-config";

    /// Mountpoint of the config volume inside a harness
    pub const CONFIG_VOLUME_TARGET: &str = "/testrig/config";

    /// Docker client configuration directory inside the config volume
    pub const DOCKER_CONFIG_DIR: &str = "/testrig/config/docker";

    /// Default docker daemon socket on the host
    pub const DEFAULT_HOST_SOCKET_PATH: &str = "/var/run/docker.sock";

    /// Where the daemon socket is mounted inside a docker harness
    pub const CONTAINER_SOCKET_PATH: &str = "/var/run/docker.sock";

    /// Command that keeps an otherwise idle harness container alive
    pub const IDLE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

    /// Variable tagging every process started by one container exec
    pub const EXEC_MARKER_VAR: &str = "TESTRIG_EXEC_ID";

    /// Seconds a cancelled exec gets between SIGTERM and SIGKILL
    pub const EXEC_KILL_GRACE_SECS: u64 = 5;
}

/// Process runner defaults
pub mod runner {
    /// Default provisioning tool binary
    pub const DEFAULT_TOOL: &str = "terraform";

    /// Prefix of ephemeral working directories
    pub const WORKDIR_PREFIX: &str = "testrig-tf-";

    /// Output name a VM template publishes to describe how to reach the machine
    pub const EXEC_PREFIX_OUTPUT: &str = "exec_prefix";
}

/// Default labels carried by every created resource.
pub fn default_labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        (labels::MANAGED.to_string(), "true".to_string()),
        (
            labels::VERSION.to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
    ])
}

/// Merge caller labels over the default labels.
pub fn with_default_labels(labels: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut merged = default_labels();
    merged.extend(labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Name of the reserved config volume for a harness.
pub fn config_volume_name(harness_id: &str) -> String {
    format!("{}{}", harness_id, harness::CONFIG_VOLUME_SUFFIX)
}

/// Build the .testrig directory path from a root
pub fn testrig_dir_path(root: &Path) -> PathBuf {
    root.join(TESTRIG_DIR_NAME)
}

/// Build config file path in user's home directory
pub fn user_config_file_path(home_dir: &Path) -> PathBuf {
    testrig_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

/// System-wide configuration file
pub fn system_config_file_path() -> PathBuf {
    PathBuf::from("/etc/testrig").join(CONFIG_FILE_NAME)
}

/// Current user's home directory
pub fn home_dir() -> Option<PathBuf> {
    std::env::var("HOME")
        .ok()
        .or_else(|| std::env::var("USERPROFILE").ok())
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

/// Build local config file path in current directory
pub fn local_config_file_path(current_dir: &Path) -> PathBuf {
    testrig_dir_path(current_dir).join(CONFIG_FILE_NAME)
}
