//! Container configuration builders.
//!
//! Translates a composed harness into the engine's create-container body.

use crate::compose::ComposedHarness;
use crate::error::{HarnessError, Result};
use crate::harness::{Mount, MountKind};
use bollard::models::MountVolumeOptions;
use bollard::service::{HostConfig, Mount as EngineMount, MountTypeEnum};
use std::collections::HashMap;

/// Container configuration builder.
#[derive(Debug, Default)]
pub struct ContainerConfigBuilder {
    image: Option<String>,
    cmd: Vec<String>,
    entrypoint: Vec<String>,
    env: Vec<String>,
    labels: HashMap<String, String>,
    memory_limit: Option<i64>,
    memory_reservation: Option<i64>,
    nano_cpus: Option<i64>,
    mounts: Vec<EngineMount>,
    privileged: bool,
    user: Option<String>,
}

impl ContainerConfigBuilder {
    /// Create a new container configuration builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the container image.
    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the command to run in the container.
    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Set the entrypoint for the container.
    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = entrypoint.into_iter().map(Into::into).collect();
        self
    }

    /// Add an environment variable.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Add a label to the container.
    pub fn label<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Set memory limit in bytes.
    pub fn memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = Some(bytes);
        self
    }

    /// Set the soft memory reservation in bytes.
    pub fn memory_reservation(mut self, bytes: i64) -> Self {
        self.memory_reservation = Some(bytes);
        self
    }

    /// Set the CPU allowance in billionths of a CPU.
    pub fn nano_cpus(mut self, nanos: i64) -> Self {
        self.nano_cpus = Some(nanos);
        self
    }

    /// Attach a bind or volume mount.
    pub fn mount(mut self, mount: &Mount) -> Self {
        let volume_options = match mount.kind {
            MountKind::Volume if !mount.labels.is_empty() => Some(MountVolumeOptions {
                labels: Some(mount.labels.clone().into_iter().collect()),
                ..Default::default()
            }),
            _ => None,
        };

        self.mounts.push(EngineMount {
            target: Some(mount.target.clone()),
            source: Some(mount.source.clone()),
            typ: Some(match mount.kind {
                MountKind::Bind => MountTypeEnum::BIND,
                MountKind::Volume => MountTypeEnum::VOLUME,
            }),
            read_only: Some(mount.read_only),
            volume_options,
            ..Default::default()
        });
        self
    }

    /// Run container in privileged mode.
    pub fn privileged(mut self, enable: bool) -> Self {
        self.privileged = enable;
        self
    }

    /// Set user to run as in the container.
    pub fn user<S: Into<String>>(mut self, user: S) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Build the container configuration.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if no image was set.
    pub fn build(self) -> Result<ContainerConfig> {
        let image = self
            .image
            .filter(|image| !image.is_empty())
            .ok_or_else(|| HarnessError::config("image is required"))?;

        let host_config = HostConfig {
            mounts: if self.mounts.is_empty() {
                None
            } else {
                Some(self.mounts)
            },
            memory: self.memory_limit,
            memory_reservation: self.memory_reservation,
            nano_cpus: self.nano_cpus,
            privileged: Some(self.privileged),
            ..Default::default()
        };

        Ok(ContainerConfig {
            image,
            cmd: non_empty(self.cmd),
            entrypoint: non_empty(self.entrypoint),
            env: non_empty(self.env),
            labels: if self.labels.is_empty() {
                None
            } else {
                Some(self.labels)
            },
            user: self.user,
            host_config,
        })
    }
}

fn non_empty(values: Vec<String>) -> Option<Vec<String>> {
    if values.is_empty() { None } else { Some(values) }
}

/// Container configuration.
#[derive(Debug, Clone)]
pub struct ContainerConfig {
    /// Image name
    pub image: String,
    /// Command to run
    pub cmd: Option<Vec<String>>,
    /// Entrypoint
    pub entrypoint: Option<Vec<String>>,
    /// Environment variables
    pub env: Option<Vec<String>>,
    /// Labels
    pub labels: Option<HashMap<String, String>>,
    /// User
    pub user: Option<String>,
    /// Host configuration
    pub host_config: HostConfig,
}

impl ContainerConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ContainerConfigBuilder {
        ContainerConfigBuilder::new()
    }

    /// Translate a composed harness, config volume included.
    ///
    /// Memory limit and request map to the hard limit and the reservation;
    /// the CPU request maps to the CPU allowance.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the request has no image.
    pub fn from_composed(harness: &ComposedHarness) -> Result<Self> {
        let request = &harness.request;
        let mut builder = Self::builder()
            .image(&request.image)
            .cmd(request.cmd.clone())
            .entrypoint(request.entrypoint.clone())
            .privileged(request.privileged);

        for (key, value) in request.env.iter() {
            builder = builder.env(key, value);
        }
        for (key, value) in &harness.labels {
            builder = builder.label(key, value);
        }
        if let Some(user) = &request.user {
            builder = builder.user(user);
        }
        for mount in harness.all_mounts() {
            builder = builder.mount(mount);
        }

        let resources = &harness.resources;
        if let Some(limit) = &resources.memory_limit {
            builder = builder.memory_limit(limit.value());
        }
        if let Some(request) = &resources.memory_request {
            builder = builder.memory_reservation(request.value());
        }
        if let Some(request) = &resources.cpu_request {
            builder = builder.nano_cpus(request.nano_value());
        }

        builder.build()
    }

    /// Get the image name.
    pub fn image(&self) -> &str {
        &self.image
    }
}
