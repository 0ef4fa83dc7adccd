//! Container lifecycle orchestration.
//!
//! Thin, logged wrappers over the engine calls a docker harness makes:
//! pull, create, connect, upload, start, exec, stop, remove.

use crate::compose::Credentials;
use crate::container::{ContainerClient, ContainerConfig, VolumeManager, executor};
use crate::error::{HarnessError, Result};
use crate::harness::{ExecConfig, ExecOutput, File};
use bollard::auth::DockerCredentials;
use futures::stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Container orchestrator configuration.
#[derive(Debug, Clone)]
pub struct ContainerOrchestratorConfig {
    /// Seconds a container gets to stop before it is killed
    pub stop_timeout: i64,
}

impl Default for ContainerOrchestratorConfig {
    fn default() -> Self {
        Self { stop_timeout: 10 }
    }
}

/// High-level container orchestrator.
#[derive(Clone)]
pub struct ContainerOrchestrator {
    client: ContainerClient,
    config: ContainerOrchestratorConfig,
}

impl ContainerOrchestrator {
    /// Connect with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if no container runtime answers.
    pub async fn new() -> Result<Self> {
        let client = ContainerClient::new().await?;
        Ok(Self::with_client(client, ContainerOrchestratorConfig::default()))
    }

    /// Create an orchestrator with an existing client.
    pub fn with_client(client: ContainerClient, config: ContainerOrchestratorConfig) -> Self {
        Self { client, config }
    }

    /// Volume client sharing this orchestrator's connection.
    pub fn volumes(&self) -> VolumeManager {
        VolumeManager::new(self.client.docker().clone())
    }

    /// Pull an image, authenticating when credentials are given.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Cancelled`] if `ctx` is cancelled, or
    /// [`HarnessError::Backend`] if the pull fails.
    pub async fn pull_image(
        &self,
        image: &str,
        credentials: Option<DockerCredentials>,
        ctx: &CancellationToken,
    ) -> Result<()> {
        info!("Pulling image: {}", image);

        let mut stream = self.client.docker().create_image(
            Some(bollard::image::CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            credentials,
        );

        loop {
            let next = tokio::select! {
                _ = ctx.cancelled() => {
                    return Err(HarnessError::Cancelled(format!("pull of {}", image)));
                }
                next = stream.next() => next,
            };
            match next {
                Some(Ok(info)) => {
                    if let Some(status) = info.status {
                        debug!("Pull status: {}", status);
                    }
                    if let Some(progress) = info.progress {
                        debug!("Pull progress: {}", progress);
                    }
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        info!("Successfully pulled image: {}", image);
        Ok(())
    }

    /// Create a container and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if creation fails.
    pub async fn create_container(&self, config: &ContainerConfig, name: &str) -> Result<String> {
        debug!("Creating container: {}", name);

        let options = bollard::container::CreateContainerOptions {
            name,
            ..Default::default()
        };

        let engine_config = bollard::container::Config {
            image: Some(config.image.clone()),
            cmd: config.cmd.clone(),
            entrypoint: config.entrypoint.clone(),
            env: config.env.clone(),
            labels: config.labels.clone(),
            user: config.user.clone(),
            host_config: Some(config.host_config.clone()),
            ..Default::default()
        };

        let response = self
            .client
            .docker()
            .create_container(Some(options), engine_config)
            .await?;

        info!("Created container: {} ({})", name, response.id);
        Ok(response.id)
    }

    /// Attach a container to an existing network.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if the network is unknown or the
    /// connection fails.
    pub async fn connect_network(&self, container_id: &str, network: &str) -> Result<()> {
        debug!("Connecting container {} to network {}", container_id, network);

        self.client
            .docker()
            .connect_network(
                network,
                bollard::network::ConnectNetworkOptions {
                    container: container_id,
                    ..Default::default()
                },
            )
            .await?;

        info!("Connected container {} to network {}", container_id, network);
        Ok(())
    }

    /// Copy a file into a created container.
    ///
    /// # Errors
    ///
    /// Returns an IO error if packaging fails, or [`HarnessError::Backend`]
    /// if the upload is rejected.
    pub async fn upload_file(&self, container_id: &str, file: &File) -> Result<()> {
        self.upload_archive(container_id, file.parent_dir(), file.archive()?)
            .await?;
        info!("Uploaded {} into container {}", file.target, container_id);
        Ok(())
    }

    /// Extract a compressed archive into `dir` inside a container.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if the upload is rejected.
    pub async fn upload_archive(&self, container_id: &str, dir: &str, archive: Vec<u8>) -> Result<()> {
        debug!("Uploading {} bytes into {}:{}", archive.len(), container_id, dir);

        self.client
            .docker()
            .upload_to_container(
                container_id,
                Some(bollard::container::UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                bollard::body_full(bytes::Bytes::from(archive)),
            )
            .await?;
        Ok(())
    }

    /// Start a container.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if the start fails.
    pub async fn start_container(&self, container_id: &str) -> Result<()> {
        debug!("Starting container: {}", container_id);

        self.client
            .docker()
            .start_container(
                container_id,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await?;

        info!("Started container: {}", container_id);
        Ok(())
    }

    /// Stop a container.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if the stop fails.
    pub async fn stop_container(&self, container_id: &str) -> Result<()> {
        debug!("Stopping container: {}", container_id);

        self.client
            .docker()
            .stop_container(
                container_id,
                Some(bollard::container::StopContainerOptions {
                    t: self.config.stop_timeout,
                }),
            )
            .await?;

        info!("Stopped container: {}", container_id);
        Ok(())
    }

    /// Remove a container together with its anonymous volumes.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if removal fails; a missing
    /// container is reported as not found.
    pub async fn remove_container(&self, container_id: &str, force: bool) -> Result<()> {
        debug!("Removing container: {}", container_id);

        self.client
            .docker()
            .remove_container(
                container_id,
                Some(bollard::container::RemoveContainerOptions {
                    force,
                    v: true,
                    ..Default::default()
                }),
            )
            .await?;

        info!("Removed container: {}", container_id);
        Ok(())
    }

    /// Stop and force-remove a container; a container that is already gone
    /// counts as removed.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`] if removal fails.
    pub async fn stop_and_remove(&self, container_id: &str) -> Result<()> {
        if let Err(e) = self.stop_container(container_id).await {
            warn!("Failed to stop container {}: {}", container_id, e);
        }

        match self.remove_container(container_id, true).await {
            Err(e) if e.is_not_found() => {
                debug!("Container {} already removed", container_id);
                Ok(())
            }
            result => result,
        }
    }

    /// Execute a command in a running container.
    ///
    /// # Errors
    ///
    /// See [`executor::execute`].
    pub async fn exec(
        &self,
        container_id: &str,
        config: &ExecConfig,
        ctx: &CancellationToken,
    ) -> Result<ExecOutput> {
        executor::execute(self.client.docker(), container_id, config, ctx).await
    }

    /// Get the underlying client.
    pub fn client(&self) -> &ContainerClient {
        &self.client
    }
}

/// Engine credentials for a registry.
///
/// A pre-encoded `auth` value is split into username and password when
/// those are not given separately.
///
/// # Errors
///
/// Returns [`HarnessError::Config`] if the encoded value is malformed.
pub fn docker_credentials(registry: &str, credentials: &Credentials) -> Result<DockerCredentials> {
    let decoded = match (&credentials.username, &credentials.auth) {
        (None, Some(auth)) => Some(Credentials::decode_auth(auth)?),
        _ => None,
    };
    let source = decoded.as_ref().unwrap_or(credentials);

    Ok(DockerCredentials {
        username: source.username.clone(),
        password: source.password.clone(),
        identitytoken: credentials.identity_token.clone(),
        serveraddress: Some(registry.to_string()),
        ..Default::default()
    })
}
