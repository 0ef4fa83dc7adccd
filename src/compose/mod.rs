//! # Configuration Composer
//!
//! Merges three layers into one validated harness description:
//!
//! 1. **Harness-type defaults** ([`HarnessDefaults`]): default image, the
//!    docker socket bind mount, `DOCKER_CONFIG` pointing into the config
//!    volume.
//! 2. **Provider defaults** ([`ProviderDefaults`]): the `[harnesses.docker]`
//!    configuration section shared by every harness.
//! 3. **Explicit overrides** ([`HarnessSpec`]): per-harness settings.
//!
//! ## Precedence
//!
//! | Field               | Rule                                                    |
//! |---------------------|---------------------------------------------------------|
//! | image, privileged   | explicit, else harness-type default                     |
//! | envs                | harness-type < provider < explicit                      |
//! | mounts              | explicit, then provider, then harness-type; no dedup    |
//! | networks/registries | keyed maps; collisions resolved by [`Precedence`]       |
//! | resources           | explicit only; absent means no limit                    |
//!
//! With the default [`Precedence::Provider`], provider entries are written
//! after the explicit ones and win on key collision.
//!
//! [`Composer::compose_request`] is pure: every map is ordered, so the same
//! inputs serialize to byte-identical output. [`Composer::compose`]
//! additionally creates the reserved `"<id>-config"` volume, after all
//! validation has passed.

use crate::env;
use crate::error::{HarnessError, Result};
use crate::harness::{ContainerRequest, Env, Mount, VolumeClient, VolumeRequest};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info};

pub mod auth;
pub mod quantity;
pub mod reference;

pub use auth::{AuthConfig, Credentials, DockerConfigKeychain, Keychain, RegistryAuth};
pub use quantity::Quantity;
pub use reference::ImageRef;

static HARNESS_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]*$").expect("static harness id pattern compiles"));

/// Host path mounted into a harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Relative or absolute host path
    pub source: String,
    /// Absolute path inside the harness
    pub destination: String,
}

/// An existing network to attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSpec {
    /// Network name
    pub name: String,
}

/// Per-registry settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySpec {
    /// Credentials; entries without an `auth` table are ignored
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

/// A managed volume mounted into a harness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    /// Volume name
    pub source: String,
    /// Absolute path inside the harness
    pub destination: String,
}

/// Request/limit pair of quantity strings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Amount requested
    #[serde(default)]
    pub request: Option<String>,
    /// Upper bound
    #[serde(default)]
    pub limit: Option<String>,
}

/// CPU and memory settings as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourcesSpec {
    /// CPU quantities (`0.5`, `500m`)
    #[serde(default)]
    pub cpu: Option<ResourceSpec>,
    /// Memory quantities (`512Mi`, `2G`)
    #[serde(default)]
    pub memory: Option<ResourceSpec>,
}

/// Parsed resource quantities; `None` means no limit requested.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResourceRequests {
    /// Requested CPUs
    pub cpu_request: Option<Quantity>,
    /// CPU limit (recorded, not enforced by the docker backend)
    pub cpu_limit: Option<Quantity>,
    /// Requested memory in bytes
    pub memory_request: Option<Quantity>,
    /// Memory limit in bytes
    pub memory_limit: Option<Quantity>,
}

impl ResourceRequests {
    /// Parse every quantity, naming the offending field on failure.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] for a malformed or negative quantity.
    pub fn parse(spec: &ResourcesSpec) -> Result<Self> {
        let cpu = spec.cpu.clone().unwrap_or_default();
        let memory = spec.memory.clone().unwrap_or_default();
        Ok(Self {
            cpu_request: parse_quantity("cpu.request", cpu.request.as_deref())?,
            cpu_limit: parse_quantity("cpu.limit", cpu.limit.as_deref())?,
            memory_request: parse_quantity("memory.request", memory.request.as_deref())?,
            memory_limit: parse_quantity("memory.limit", memory.limit.as_deref())?,
        })
    }

    /// Whether nothing was requested.
    pub fn is_empty(&self) -> bool {
        self.cpu_request.is_none()
            && self.cpu_limit.is_none()
            && self.memory_request.is_none()
            && self.memory_limit.is_none()
    }
}

fn parse_quantity(field: &str, value: Option<&str>) -> Result<Option<Quantity>> {
    value
        .map(|value| {
            Quantity::parse(value).map_err(|e| HarnessError::config(format!("resources.{}: {}", field, e)))
        })
        .transpose()
}

/// Provider-wide docker harness settings (`[harnesses.docker]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderDefaults {
    /// Docker daemon socket on the host
    pub host_socket_path: Option<String>,
    /// Mounts added to every harness
    pub mounts: Vec<MountSpec>,
    /// Networks every harness joins
    pub networks: BTreeMap<String, NetworkSpec>,
    /// Registry settings shared by every harness
    pub registries: BTreeMap<String, RegistrySpec>,
    /// Environment variables set in every harness
    pub envs: BTreeMap<String, String>,
}

/// Which layer wins when provider and explicit maps share a key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precedence {
    /// Provider entries are applied last and win
    #[default]
    Provider,
    /// Explicit per-harness entries win
    Resource,
}

/// Defaults of the harness type itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessDefaults {
    /// Image used when none is given
    pub image: String,
    /// Privileged unless overridden
    pub privileged: bool,
    /// Lowest-precedence environment
    pub envs: BTreeMap<String, String>,
    /// Mounts appended after explicit and provider mounts
    pub mounts: Vec<Mount>,
    /// Command keeping the container alive between steps
    pub cmd: Vec<String>,
}

impl HarnessDefaults {
    /// Docker harness defaults for a provider configuration.
    pub fn docker(provider: &ProviderDefaults) -> Self {
        let socket = provider
            .host_socket_path
            .clone()
            .unwrap_or_else(|| env::harness::DEFAULT_HOST_SOCKET_PATH.to_string());

        Self {
            image: env::harness::DEFAULT_DOCKER_IMAGE.to_string(),
            privileged: false,
            envs: BTreeMap::from([(
                "DOCKER_CONFIG".to_string(),
                env::harness::DOCKER_CONFIG_DIR.to_string(),
            )]),
            mounts: vec![Mount::bind(socket, env::harness::CONTAINER_SOCKET_PATH)],
            cmd: env::harness::IDLE_COMMAND.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Per-harness overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessSpec {
    /// Harness id; also names the config volume
    pub id: String,
    /// Image reference
    pub image: Option<String>,
    /// Run privileged
    pub privileged: Option<bool>,
    /// Entrypoint override
    pub entrypoint: Vec<String>,
    /// User as numeric `uid:gid`
    pub user: Option<String>,
    /// Environment variables
    pub envs: BTreeMap<String, String>,
    /// Host bind mounts
    pub mounts: Vec<MountSpec>,
    /// Networks keyed by an arbitrary label
    pub networks: BTreeMap<String, NetworkSpec>,
    /// Registries keyed by address
    pub registries: BTreeMap<String, RegistrySpec>,
    /// CPU and memory
    pub resources: Option<ResourcesSpec>,
    /// Managed volumes
    pub volumes: Vec<VolumeSpec>,
}

impl HarnessSpec {
    /// A spec with only an id.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; a missing id is generated.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the document is malformed.
    pub fn from_toml(source: &str) -> Result<Self> {
        let mut spec: Self = toml::from_str(source)
            .map_err(|e| HarnessError::config(format!("invalid harness spec: {}", e)))?;
        if spec.id.is_empty() {
            spec.id = generate_id();
        }
        Ok(spec)
    }
}

/// A fresh harness id, `testrig-` followed by 12 hex digits.
pub fn generate_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("testrig-{}", &uuid[..12])
}

/// Fully merged docker harness description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComposedHarness {
    /// Harness id
    pub id: String,
    /// Container request
    pub request: ContainerRequest,
    /// Bind and managed volume mounts, in attach order
    pub mounts: Vec<Mount>,
    /// Registry authentication keyed by address
    pub registries: BTreeMap<String, RegistryAuth>,
    /// Resource requests
    pub resources: ResourceRequests,
    /// Container labels
    pub labels: BTreeMap<String, String>,
    /// Reserved config volume, once created
    pub config_volume: Option<Mount>,
}

impl ComposedHarness {
    /// Every mount including the config volume.
    pub fn all_mounts(&self) -> impl Iterator<Item = &Mount> {
        self.mounts.iter().chain(self.config_volume.iter())
    }

    /// Canonical JSON rendering for idempotence checks.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| HarnessError::config(format!("cannot render harness {}: {}", self.id, e)))
    }
}

/// Layered configuration merge.
#[derive(Debug, Clone)]
pub struct Composer {
    provider: ProviderDefaults,
    harness: HarnessDefaults,
    precedence: Precedence,
    base_dir: PathBuf,
}

impl Composer {
    /// Create a composer; relative mount sources resolve against `base_dir`.
    pub fn new(provider: ProviderDefaults, base_dir: impl Into<PathBuf>) -> Self {
        let harness = HarnessDefaults::docker(&provider);
        Self {
            provider,
            harness,
            precedence: Precedence::default(),
            base_dir: base_dir.into(),
        }
    }

    /// Set the collision policy for networks and registries.
    pub fn with_precedence(mut self, precedence: Precedence) -> Self {
        self.precedence = precedence;
        self
    }

    /// Replace the harness-type defaults.
    pub fn with_harness_defaults(mut self, harness: HarnessDefaults) -> Self {
        self.harness = harness;
        self
    }

    /// Collision policy in use.
    pub fn precedence(&self) -> Precedence {
        self.precedence
    }

    /// Merge all layers without touching any backend.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] for a malformed id, image reference,
    /// mount path, environment key, or quantity.
    pub fn compose_request(&self, spec: &HarnessSpec) -> Result<ComposedHarness> {
        if !HARNESS_ID.is_match(&spec.id) {
            return Err(HarnessError::config(format!(
                "invalid harness id {:?}: expected letters, digits, '_', '.' or '-'",
                spec.id
            )));
        }

        let image = spec.image.clone().unwrap_or_else(|| self.harness.image.clone());
        let privileged = spec.privileged.unwrap_or(self.harness.privileged);

        let mut envs = self.harness.envs.clone();
        envs.extend(self.provider.envs.clone());
        envs.extend(spec.envs.clone());
        let env = Env::from_pairs(envs)?;

        let networks = self.layer(&spec.networks, &self.provider.networks);
        let mut builder = ContainerRequest::builder()
            .image(image)
            .privileged(privileged)
            .entrypoint(spec.entrypoint.clone())
            .envs(&env)
            .cmd(self.harness.cmd.clone());
        if let Some(user) = &spec.user {
            builder = builder.user(user.clone());
        }
        for network in networks.values() {
            if network.name.is_empty() {
                return Err(HarnessError::config("network name is empty"));
            }
            builder = builder.network(network.name.clone());
        }
        let request = builder.build()?;

        let mut mounts = Vec::new();
        for mount in spec.mounts.iter().chain(&self.provider.mounts) {
            let source = absolutize(&self.base_dir, &mount.source)?;
            mounts.push(Mount::bind(source, destination(&mount.destination)?));
        }
        mounts.extend(self.harness.mounts.iter().cloned());
        for volume in &spec.volumes {
            if volume.source.is_empty() {
                return Err(HarnessError::config("volume source is empty"));
            }
            mounts.push(Mount::volume(
                volume.source.clone(),
                destination(&volume.destination)?,
            ));
        }

        let registries = self
            .layer(&spec.registries, &self.provider.registries)
            .into_iter()
            .filter_map(|(address, registry)| {
                registry.auth.map(|auth| (address, RegistryAuth::from_config(&auth)))
            })
            .collect();

        let resources = match &spec.resources {
            Some(resources) => ResourceRequests::parse(resources)?,
            None => ResourceRequests::default(),
        };

        let mut labels = env::default_labels();
        labels.insert(env::labels::HARNESS_ID.to_string(), spec.id.clone());

        Ok(ComposedHarness {
            id: spec.id.clone(),
            request,
            mounts,
            registries,
            resources,
            labels,
            config_volume: None,
        })
    }

    /// Merge all layers, then create the reserved config volume.
    ///
    /// Nothing is created when validation fails.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] from validation or
    /// [`HarnessError::Backend`] if the volume cannot be created.
    pub async fn compose(&self, spec: &HarnessSpec, volumes: &dyn VolumeClient) -> Result<ComposedHarness> {
        let mut composed = self.compose_request(spec)?;
        debug!("Composed harness {}: {:?}", composed.id, composed.request);

        let request = VolumeRequest {
            name: env::config_volume_name(&composed.id),
            target: env::harness::CONFIG_VOLUME_TARGET.to_string(),
            labels: env::default_labels(),
        };
        let mount = volumes.create_volume(&request).await?;
        info!("Created config volume {} for harness {}", mount.source, composed.id);

        composed.config_volume = Some(mount);
        Ok(composed)
    }

    fn layer<V: Clone>(
        &self,
        explicit: &BTreeMap<String, V>,
        provider: &BTreeMap<String, V>,
    ) -> BTreeMap<String, V> {
        let (base, top) = match self.precedence {
            Precedence::Provider => (explicit, provider),
            Precedence::Resource => (provider, explicit),
        };
        let mut merged = base.clone();
        merged.extend(top.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }
}

fn destination(path: &str) -> Result<String> {
    if !path.starts_with('/') {
        return Err(HarnessError::config(format!(
            "mount destination {:?} must be an absolute path",
            path
        )));
    }
    Ok(path.to_string())
}

/// Resolve `source` against `base` and normalize `.` and `..` lexically.
fn absolutize(base: &Path, source: &str) -> Result<String> {
    if source.is_empty() {
        return Err(HarnessError::config("mount source is empty"));
    }

    let joined = base.join(source);
    if !joined.is_absolute() {
        return Err(HarnessError::config(format!(
            "mount source {:?} does not resolve to an absolute path",
            source
        )));
    }

    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }

    normalized
        .to_str()
        .map(str::to_string)
        .ok_or_else(|| HarnessError::config(format!("mount source {:?} is not valid UTF-8", source)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::MountKind;

    fn composer(provider: ProviderDefaults) -> Composer {
        Composer::new(provider, "/work/project")
    }

    fn network(name: &str) -> NetworkSpec {
        NetworkSpec {
            name: name.to_string(),
        }
    }

    #[test]
    fn test_defaults_only() {
        let composed = composer(ProviderDefaults::default())
            .compose_request(&HarnessSpec::new("h1"))
            .unwrap();

        assert_eq!(composed.request.image, env::harness::DEFAULT_DOCKER_IMAGE);
        assert!(!composed.request.privileged);
        assert_eq!(composed.request.cmd, vec!["tail", "-f", "/dev/null"]);
        assert_eq!(
            composed.request.env.get("DOCKER_CONFIG"),
            Some(env::harness::DOCKER_CONFIG_DIR)
        );
        assert_eq!(
            composed.mounts,
            vec![Mount::bind("/var/run/docker.sock", "/var/run/docker.sock")]
        );
        assert!(composed.resources.is_empty());
        assert_eq!(
            composed.labels.get(env::labels::HARNESS_ID).map(String::as_str),
            Some("h1")
        );
        assert!(composed.config_volume.is_none());
    }

    #[test]
    fn test_env_precedence() {
        let provider = ProviderDefaults {
            envs: BTreeMap::from([
                ("SHARED".to_string(), "provider".to_string()),
                ("DOCKER_CONFIG".to_string(), "/provider".to_string()),
            ]),
            ..Default::default()
        };
        let mut spec = HarnessSpec::new("h1");
        spec.envs.insert("SHARED".to_string(), "explicit".to_string());

        let composed = composer(provider).compose_request(&spec).unwrap();
        assert_eq!(composed.request.env.get("SHARED"), Some("explicit"));
        assert_eq!(composed.request.env.get("DOCKER_CONFIG"), Some("/provider"));
    }

    #[test]
    fn test_mount_order() {
        let provider = ProviderDefaults {
            host_socket_path: Some("/run/user/1000/docker.sock".to_string()),
            mounts: vec![MountSpec {
                source: "/srv/cache".to_string(),
                destination: "/cache".to_string(),
            }],
            ..Default::default()
        };
        let mut spec = HarnessSpec::new("h1");
        spec.mounts.push(MountSpec {
            source: "./fixtures/../data".to_string(),
            destination: "/data".to_string(),
        });
        spec.volumes.push(VolumeSpec {
            source: "shared-vol".to_string(),
            destination: "/shared".to_string(),
        });

        let composed = composer(provider).compose_request(&spec).unwrap();
        let mounts: Vec<(MountKind, &str, &str)> = composed
            .mounts
            .iter()
            .map(|m| (m.kind, m.source.as_str(), m.target.as_str()))
            .collect();
        assert_eq!(
            mounts,
            vec![
                (MountKind::Bind, "/work/project/data", "/data"),
                (MountKind::Bind, "/srv/cache", "/cache"),
                (MountKind::Bind, "/run/user/1000/docker.sock", "/var/run/docker.sock"),
                (MountKind::Volume, "shared-vol", "/shared"),
            ]
        );
    }

    #[test]
    fn test_duplicate_mounts_are_kept() {
        let shared = MountSpec {
            source: "/srv/cache".to_string(),
            destination: "/cache".to_string(),
        };
        let provider = ProviderDefaults {
            mounts: vec![shared.clone()],
            ..Default::default()
        };
        let mut spec = HarnessSpec::new("h1");
        spec.mounts.push(shared);

        let composed = composer(provider).compose_request(&spec).unwrap();
        assert_eq!(composed.mounts.iter().filter(|m| m.target == "/cache").count(), 2);
    }

    #[test]
    fn test_provider_wins_network_collision() {
        let provider = ProviderDefaults {
            networks: BTreeMap::from([("default".to_string(), network("provider-net"))]),
            ..Default::default()
        };
        let mut spec = HarnessSpec::new("h1");
        spec.networks.insert("default".to_string(), network("explicit-net"));
        spec.networks.insert("extra".to_string(), network("extra-net"));

        let composed = composer(provider.clone()).compose_request(&spec).unwrap();
        assert_eq!(composed.request.networks, vec!["provider-net", "extra-net"]);

        let composed = composer(provider)
            .with_precedence(Precedence::Resource)
            .compose_request(&spec)
            .unwrap();
        assert_eq!(composed.request.networks, vec!["explicit-net", "extra-net"]);
    }

    #[test]
    fn test_registry_auth_resolution() {
        let provider = ProviderDefaults {
            registries: BTreeMap::from([(
                "cgr.dev".to_string(),
                RegistrySpec {
                    auth: Some(AuthConfig::default()),
                },
            )]),
            ..Default::default()
        };
        let mut spec = HarnessSpec::new("h1");
        spec.registries.insert(
            "cgr.dev".to_string(),
            RegistrySpec {
                auth: Some(AuthConfig {
                    username: Some("explicit".to_string()),
                    password: Some("secret".to_string()),
                    auth: None,
                }),
            },
        );
        spec.registries.insert(
            "ghcr.io".to_string(),
            RegistrySpec {
                auth: Some(AuthConfig {
                    username: Some("bot".to_string()),
                    password: Some("pat".to_string()),
                    auth: None,
                }),
            },
        );
        spec.registries.insert("quay.io".to_string(), RegistrySpec { auth: None });

        let composed = composer(provider).compose_request(&spec).unwrap();
        assert_eq!(composed.registries.get("cgr.dev"), Some(&RegistryAuth::Keychain));
        assert_eq!(
            composed.registries.get("ghcr.io"),
            Some(&RegistryAuth::Static(Credentials::basic("bot", "pat")))
        );
        assert!(!composed.registries.contains_key("quay.io"));
    }

    #[test]
    fn test_resources() {
        let mut spec = HarnessSpec::new("h1");
        spec.resources = Some(ResourcesSpec {
            cpu: Some(ResourceSpec {
                request: Some("500m".to_string()),
                limit: None,
            }),
            memory: Some(ResourceSpec {
                request: Some("256Mi".to_string()),
                limit: Some("1Gi".to_string()),
            }),
        });

        let composed = composer(ProviderDefaults::default()).compose_request(&spec).unwrap();
        let resources = &composed.resources;
        assert_eq!(resources.cpu_request.as_ref().map(Quantity::nano_value), Some(500_000_000));
        assert!(resources.cpu_limit.is_none());
        assert_eq!(resources.memory_limit.as_ref().map(Quantity::value), Some(1 << 30));
    }

    #[test]
    fn test_config_errors() {
        let composer = composer(ProviderDefaults::default());

        let mut bad_quantity = HarnessSpec::new("h1");
        bad_quantity.resources = Some(ResourcesSpec {
            memory: Some(ResourceSpec {
                request: None,
                limit: Some("lots".to_string()),
            }),
            cpu: None,
        });
        let err = composer.compose_request(&bad_quantity).unwrap_err();
        assert!(err.to_string().contains("memory.limit"));
        assert!(err.to_string().contains("lots"));

        let mut bad_image = HarnessSpec::new("h1");
        bad_image.image = Some("UPPER/Case::bad".to_string());
        assert!(matches!(
            composer.compose_request(&bad_image),
            Err(HarnessError::Config(_))
        ));

        let mut bad_destination = HarnessSpec::new("h1");
        bad_destination.mounts.push(MountSpec {
            source: "/tmp".to_string(),
            destination: "relative".to_string(),
        });
        let err = composer.compose_request(&bad_destination).unwrap_err();
        assert!(err.to_string().contains("relative"));

        assert!(composer.compose_request(&HarnessSpec::new("")).is_err());
        assert!(composer.compose_request(&HarnessSpec::new("a/b")).is_err());
    }

    #[test]
    fn test_user_and_entrypoint_reach_request() {
        let composer = composer(ProviderDefaults::default());
        let spec = HarnessSpec::from_toml(
            r#"
            id = "h1"
            user = "1000:1000"
            entrypoint = ["/bin/sh", "-c"]
            "#,
        )
        .unwrap();

        let composed = composer.compose_request(&spec).unwrap();
        assert_eq!(composed.request.user.as_deref(), Some("1000:1000"));
        assert_eq!(composed.request.entrypoint, vec!["/bin/sh", "-c"]);
        assert_eq!(composed.request.cmd, vec!["tail", "-f", "/dev/null"]);

        let defaults = composer.compose_request(&HarnessSpec::new("h2")).unwrap();
        assert!(defaults.request.user.is_none());
        assert!(defaults.request.entrypoint.is_empty());

        let mut named_user = HarnessSpec::new("h3");
        named_user.user = Some("root".to_string());
        let err = composer.compose_request(&named_user).unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
        assert!(err.to_string().contains("uid:gid"));
    }

    #[test]
    fn test_deterministic_output() {
        let provider = ProviderDefaults {
            envs: BTreeMap::from([
                ("B".to_string(), "2".to_string()),
                ("A".to_string(), "1".to_string()),
            ]),
            networks: BTreeMap::from([
                ("z".to_string(), network("zeta")),
                ("a".to_string(), network("alpha")),
            ]),
            ..Default::default()
        };
        let spec = HarnessSpec::from_toml(
            r#"
            id = "det"
            image = "cgr.dev/chainguard/wolfi-base:latest"

            [envs]
            Z = "26"
            C = "3"

            [registries."cgr.dev".auth]
            "#,
        )
        .unwrap();

        let composer = composer(provider);
        let first = composer.compose_request(&spec).unwrap().to_json().unwrap();
        for _ in 0..10 {
            assert_eq!(composer.compose_request(&spec).unwrap().to_json().unwrap(), first);
        }
    }

    #[test]
    fn test_spec_without_id_gets_one() {
        let spec = HarnessSpec::from_toml("image = \"alpine:3.20\"").unwrap();
        assert!(spec.id.starts_with("testrig-"));
        assert_eq!(spec.id.len(), "testrig-".len() + 12);
        assert!(HARNESS_ID.is_match(&spec.id));

        let spec = HarnessSpec::from_toml("id = \"fixed\"").unwrap();
        assert_eq!(spec.id, "fixed");
    }

    #[test]
    fn test_absolutize() {
        let base = Path::new("/base/dir");
        assert_eq!(absolutize(base, "/abs/path").unwrap(), "/abs/path");
        assert_eq!(absolutize(base, "rel").unwrap(), "/base/dir/rel");
        assert_eq!(absolutize(base, "./a/./b/../c").unwrap(), "/base/dir/a/c");
        assert!(absolutize(base, "").is_err());
    }
}
