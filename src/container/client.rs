//! Docker/Podman client wrapper.
//!
//! Connects to an explicitly configured daemon socket when one is given,
//! otherwise falls back through the local defaults and the usual Podman
//! sockets.

use crate::error::{HarnessError, Result};
use bollard::Docker;
use std::sync::Arc;
use tracing::{debug, info};

/// Container client configuration.
#[derive(Debug, Clone)]
pub struct ContainerClientConfig {
    /// Request timeout in seconds
    pub timeout: u64,
    /// Daemon socket to use instead of the local defaults
    pub socket_path: Option<String>,
}

impl Default for ContainerClientConfig {
    fn default() -> Self {
        Self {
            timeout: 120,
            socket_path: None,
        }
    }
}

impl ContainerClientConfig {
    /// Connect through a specific daemon socket.
    pub fn with_socket_path(mut self, path: impl Into<String>) -> Self {
        self.socket_path = Some(path.into());
        self
    }
}

/// Docker/Podman API client wrapper.
#[derive(Clone)]
pub struct ContainerClient {
    docker: Arc<Docker>,
}

impl ContainerClient {
    /// Connect with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if no container runtime answers.
    pub async fn new() -> Result<Self> {
        Self::with_config(ContainerClientConfig::default()).await
    }

    /// Connect with custom configuration and verify the daemon responds.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if the connection or ping fails.
    pub async fn with_config(config: ContainerClientConfig) -> Result<Self> {
        let docker = Self::connect(&config)?;
        let client = Self {
            docker: Arc::new(docker),
        };
        client.ping().await?;
        Ok(client)
    }

    /// Tries, in order:
    /// 1. The configured socket path
    /// 2. Local defaults (`DOCKER_HOST` or the platform socket)
    /// 3. Rootless then system Podman sockets
    fn connect(config: &ContainerClientConfig) -> Result<Docker> {
        if let Some(path) = &config.socket_path {
            debug!("Connecting to container runtime at {}", path);
            let docker = Docker::connect_with_socket(path, config.timeout, bollard::API_DEFAULT_VERSION)?;
            info!("Connected to container runtime at {}", path);
            return Ok(docker);
        }

        debug!("Attempting to connect to container runtime...");
        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Connected to container runtime via local defaults");
                return Ok(docker);
            }
            Err(e) => {
                debug!("Local defaults failed: {}", e);
            }
        }

        #[cfg(unix)]
        {
            let mut sockets = Vec::new();
            if let Some(home) = crate::env::home_dir() {
                sockets.push(format!("unix://{}/run/podman/podman.sock", home.display()));
            }
            sockets.push("unix:///run/podman/podman.sock".to_string());

            for socket in sockets {
                debug!("Trying Podman socket: {}", socket);
                match Docker::connect_with_socket(&socket, config.timeout, bollard::API_DEFAULT_VERSION) {
                    Ok(docker) => {
                        info!("Connected to Podman via {}", socket);
                        return Ok(docker);
                    }
                    Err(e) => {
                        debug!("Podman socket {} failed: {}", socket, e);
                    }
                }
            }
        }

        Err(HarnessError::backend(
            "failed to connect to Docker or Podman; ensure a container runtime is installed and running",
        ))
    }

    /// Ping the container runtime to verify connectivity.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if the ping fails.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| HarnessError::backend(format!("failed to ping container runtime: {}", e)))?;
        debug!("Container runtime ping successful");
        Ok(())
    }

    /// The underlying bollard client.
    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ContainerClientConfig::default();
        assert_eq!(config.timeout, 120);
        assert!(config.socket_path.is_none());

        let config = config.with_socket_path("/run/user/1000/docker.sock");
        assert_eq!(config.socket_path.as_deref(), Some("/run/user/1000/docker.sock"));
    }
}
