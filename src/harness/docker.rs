//! Container engine backend.
//!
//! `start` resolves registry credentials, pulls the image, creates the
//! container named after the harness id, attaches networks, injects files
//! and the docker client configuration, then starts it. `teardown` removes
//! the container and the reserved config volume; resources that are already
//! gone count as removed.

use crate::compose::{ComposedHarness, Credentials, DockerConfigKeychain, Keychain, reference};
use crate::container::{ContainerConfig, ContainerOrchestrator, docker_credentials};
use crate::env;
use crate::error::{HarnessError, Result};
use crate::harness::{ExecConfig, ExecOutput, Mount, Runtime, VolumeClient, archive};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Docker Hub spellings that share one credential entry.
const DOCKER_HUB_ALIASES: [&str; 3] = ["docker.io", "registry-1.docker.io", reference::DEFAULT_REGISTRY];

/// Container backed harness.
pub struct DockerRuntime {
    harness: ComposedHarness,
    orchestrator: ContainerOrchestrator,
    keychain: Arc<dyn Keychain>,
    volumes: Arc<dyn VolumeClient>,
    container_id: Option<String>,
    config_volume: Option<Mount>,
}

impl std::fmt::Debug for DockerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerRuntime")
            .field("id", &self.harness.id)
            .field("container_id", &self.container_id)
            .field("config_volume", &self.config_volume)
            .finish()
    }
}

impl DockerRuntime {
    /// Create a backend for a composed harness.
    ///
    /// Credentials come from the docker CLI configuration and volumes are
    /// removed through the orchestrator's connection unless overridden.
    pub fn new(harness: ComposedHarness, orchestrator: ContainerOrchestrator) -> Self {
        let volumes = Arc::new(orchestrator.volumes());
        let config_volume = harness.config_volume.clone();
        Self {
            harness,
            orchestrator,
            keychain: Arc::new(DockerConfigKeychain::new()),
            volumes,
            container_id: None,
            config_volume,
        }
    }

    /// Use a different credential store for keychain registry entries.
    pub fn with_keychain(mut self, keychain: Arc<dyn Keychain>) -> Self {
        self.keychain = keychain;
        self
    }

    /// Use a different volume client for removing the config volume.
    pub fn with_volume_client(mut self, volumes: Arc<dyn VolumeClient>) -> Self {
        self.volumes = volumes;
        self
    }

    /// Engine id of the container, once created.
    pub fn container_id(&self) -> Option<&str> {
        self.container_id.as_deref()
    }

    /// The composed description this backend runs.
    pub fn harness(&self) -> &ComposedHarness {
        &self.harness
    }

    async fn resolve_credentials(&self) -> Result<BTreeMap<String, Credentials>> {
        let mut resolved = BTreeMap::new();
        for (address, auth) in &self.harness.registries {
            match auth.resolve(address, self.keychain.as_ref()).await? {
                Some(credentials) => {
                    debug!("Resolved credentials for registry {}", address);
                    resolved.insert(address.clone(), credentials);
                }
                None => debug!("No credentials for registry {}, pulling anonymously", address),
            }
        }
        Ok(resolved)
    }

    async fn upload_docker_config(&self, container_id: &str, resolved: &BTreeMap<String, Credentials>) -> Result<()> {
        let Some(volume) = &self.config_volume else {
            return Ok(());
        };

        let relative = Path::new(env::harness::DOCKER_CONFIG_DIR)
            .strip_prefix(&volume.target)
            .map_err(|_| {
                HarnessError::config(format!(
                    "docker config directory {} is outside the config volume at {}",
                    env::harness::DOCKER_CONFIG_DIR,
                    volume.target
                ))
            })?
            .join("config.json");

        let contents = docker_config_json(resolved)?;
        let archive = archive::package_entry(contents.as_slice(), &relative, 0o600)?;
        self.orchestrator
            .upload_archive(container_id, &volume.target, archive)
            .await?;
        debug!("Wrote docker config for {} registries", resolved.len());
        Ok(())
    }
}

/// Registry key in `registries` that serves `registry`.
fn registry_entry<'a>(resolved: &'a BTreeMap<String, Credentials>, registry: &str) -> Option<(&'a str, &'a Credentials)> {
    if let Some((address, credentials)) = resolved.get_key_value(registry) {
        return Some((address.as_str(), credentials));
    }
    if DOCKER_HUB_ALIASES.contains(&registry) {
        return DOCKER_HUB_ALIASES
            .iter()
            .find_map(|alias| resolved.get_key_value(*alias))
            .map(|(address, credentials)| (address.as_str(), credentials));
    }
    None
}

/// Render a docker client `config.json` carrying every resolved registry.
///
/// # Errors
///
/// Returns [`HarnessError::Config`] if serialization fails.
pub fn docker_config_json(resolved: &BTreeMap<String, Credentials>) -> Result<Vec<u8>> {
    let mut auths = Map::new();
    for (address, credentials) in resolved {
        let mut entry = Map::new();
        if let Some(auth) = credentials.encoded_auth() {
            entry.insert("auth".to_string(), Value::String(auth));
        }
        if let Some(token) = &credentials.identity_token {
            entry.insert("identitytoken".to_string(), Value::String(token.clone()));
        }
        auths.insert(address.clone(), Value::Object(entry));
    }

    serde_json::to_vec_pretty(&json!({ "auths": auths }))
        .map_err(|e| HarnessError::config(format!("cannot render docker config: {}", e)))
}

/// Pull reference pinned to a single tag.
///
/// The engine pulls every tag when given a bare repository, so untagged
/// references get `latest`.
fn pull_reference(image: &str, parsed: &reference::ImageRef) -> String {
    if parsed.tag().is_none() && parsed.digest().is_none() {
        format!("{}:latest", image)
    } else {
        image.to_string()
    }
}

#[async_trait]
impl Runtime for DockerRuntime {
    async fn start(&mut self, ctx: &CancellationToken) -> Result<()> {
        let request = &self.harness.request;
        let image = request.image_ref()?;
        let resolved = self.resolve_credentials().await?;

        let credentials = registry_entry(&resolved, image.registry())
            .map(|(address, credentials)| docker_credentials(address, credentials))
            .transpose()?;
        self.orchestrator
            .pull_image(&pull_reference(&request.image, &image), credentials, ctx)
            .await?;

        let config = ContainerConfig::from_composed(&self.harness)?;
        let container_id = self
            .orchestrator
            .create_container(&config, &self.harness.id)
            .await?;
        self.container_id = Some(container_id.clone());

        for network in &self.harness.request.networks {
            self.orchestrator.connect_network(&container_id, network).await?;
        }
        for file in &self.harness.request.files {
            self.orchestrator.upload_file(&container_id, file).await?;
        }
        self.upload_docker_config(&container_id, &resolved).await?;

        if ctx.is_cancelled() {
            return Err(HarnessError::Cancelled(format!("start of harness {}", self.harness.id)));
        }
        self.orchestrator.start_container(&container_id).await?;

        info!(
            "Docker harness {} running as container {}",
            self.harness.id, container_id
        );
        Ok(())
    }

    async fn teardown(&mut self, _ctx: &CancellationToken) -> Result<()> {
        if let Some(container_id) = &self.container_id {
            self.orchestrator.stop_and_remove(container_id).await?;
            self.container_id = None;
        }

        if let Some(volume) = &self.config_volume {
            match self.volumes.remove_volume(volume).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    warn!("Config volume {} was already removed", volume.source);
                }
                Err(e) => return Err(e),
            }
            self.config_volume = None;
        }
        Ok(())
    }

    async fn exec(&mut self, ctx: &CancellationToken, config: &ExecConfig) -> Result<ExecOutput> {
        let container_id = self.container_id.as_deref().ok_or_else(|| HarnessError::InvalidState {
            operation: "exec",
            state: "without a container".to_string(),
        })?;
        self.orchestrator.exec(container_id, config, ctx).await
    }

    fn kind(&self) -> &'static str {
        "docker"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_docker_config_json() {
        let resolved = BTreeMap::from([
            ("cgr.dev".to_string(), Credentials::basic("ci", "secret")),
            (
                "example.azurecr.io".to_string(),
                Credentials {
                    identity_token: Some("refresh".to_string()),
                    ..Default::default()
                },
            ),
        ]);

        let rendered: Value = serde_json::from_slice(&docker_config_json(&resolved).unwrap()).unwrap();
        assert_eq!(rendered["auths"]["cgr.dev"]["auth"], "Y2k6c2VjcmV0");
        assert_eq!(rendered["auths"]["example.azurecr.io"]["identitytoken"], "refresh");
        assert!(rendered["auths"]["example.azurecr.io"].get("auth").is_none());
    }

    #[test]
    fn test_empty_docker_config() {
        let rendered: Value = serde_json::from_slice(&docker_config_json(&BTreeMap::new()).unwrap()).unwrap();
        assert_eq!(rendered, json!({ "auths": {} }));
    }

    #[test]
    fn test_registry_entry_matches_docker_hub_aliases() {
        let resolved = BTreeMap::from([("docker.io".to_string(), Credentials::basic("me", "pw"))]);

        let (address, _) = registry_entry(&resolved, reference::DEFAULT_REGISTRY).unwrap();
        assert_eq!(address, "docker.io");
        assert!(registry_entry(&resolved, "ghcr.io").is_none());
    }

    #[test]
    fn test_pull_reference_defaults_to_latest() {
        let untagged = reference::ImageRef::parse("alpine").unwrap();
        assert_eq!(pull_reference("alpine", &untagged), "alpine:latest");

        let tagged = reference::ImageRef::parse("alpine:3.20").unwrap();
        assert_eq!(pull_reference("alpine:3.20", &tagged), "alpine:3.20");
    }
}
