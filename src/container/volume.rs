//! Container volume management.
//!
//! [`VolumeManager`] is the engine-backed [`VolumeClient`]. The create call
//! carries only the caller's labels; the returned [`Mount`] carries them
//! merged over [`default_labels`](crate::env::default_labels).

use crate::env;
use crate::error::Result;
use crate::harness::{Mount, MountKind, VolumeClient, VolumeRequest};
use async_trait::async_trait;
use bollard::Docker;
use std::collections::HashMap;
use tracing::{debug, info};

/// Volume manager for persistent storage.
#[derive(Clone)]
pub struct VolumeManager {
    docker: Docker,
    driver: String,
}

impl VolumeManager {
    /// Create a volume manager using the `local` driver.
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            driver: "local".to_string(),
        }
    }

    /// Use a different volume driver.
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.driver = driver.into();
        self
    }

    /// Check if a volume exists.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`](crate::HarnessError::Backend) if
    /// inspection fails for any reason other than the volume being absent.
    pub async fn volume_exists(&self, volume_name: &str) -> Result<bool> {
        match self.docker.inspect_volume(volume_name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl VolumeClient for VolumeManager {
    async fn create_volume(&self, request: &VolumeRequest) -> Result<Mount> {
        debug!("Creating volume: {:?}", request.name);

        let labels: HashMap<&str, &str> = request
            .labels
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let response = self
            .docker
            .create_volume(bollard::volume::CreateVolumeOptions {
                name: request.name.as_str(),
                driver: self.driver.as_str(),
                driver_opts: HashMap::new(),
                labels,
            })
            .await?;

        info!("Created volume: {}", response.name);

        Ok(Mount {
            kind: MountKind::Volume,
            source: response.name,
            target: request.target.clone(),
            labels: env::with_default_labels(&request.labels),
            read_only: false,
        })
    }

    async fn remove_volume(&self, mount: &Mount) -> Result<()> {
        debug!("Removing volume: {}", mount.source);

        self.docker
            .remove_volume(
                &mount.source,
                Some(bollard::volume::RemoveVolumeOptions { force: true }),
            )
            .await?;

        info!("Removed volume: {}", mount.source);
        Ok(())
    }
}
