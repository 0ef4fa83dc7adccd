//! Registry authentication.
//!
//! A registry entry either carries static credentials or, when every
//! credential field is empty, defers to a [`Keychain`] lookup by registry
//! address at pull time. [`DockerConfigKeychain`] reads the same files the
//! docker CLI does: `$DOCKER_CONFIG/config.json` (or `~/.docker/config.json`),
//! its `auths` entries, and `credHelpers` / `credsStore` credential helpers.

use crate::error::{HarnessError, Result};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

/// Docker Hub's canonical registry host.
const DOCKER_HUB: &str = "index.docker.io";

/// Legacy key the docker CLI stores Docker Hub credentials under.
const DOCKER_HUB_LEGACY: &str = "https://index.docker.io/v1/";

/// Credential fields of a registry entry, as written in configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Username
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Pre-encoded `base64(username:password)`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
}

impl AuthConfig {
    /// Whether every credential field is absent or empty.
    pub fn is_empty(&self) -> bool {
        [&self.username, &self.password, &self.auth]
            .iter()
            .all(|field| field.as_deref().is_none_or(str::is_empty))
    }
}

/// How credentials for one registry are obtained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RegistryAuth {
    /// Credentials given directly in configuration
    Static(Credentials),
    /// Look the registry address up in the ambient credential store
    Keychain,
}

impl RegistryAuth {
    /// Choose static credentials or a keychain lookup for an entry.
    pub fn from_config(config: &AuthConfig) -> Self {
        if config.is_empty() {
            return Self::Keychain;
        }
        Self::Static(Credentials {
            username: non_empty(&config.username),
            password: non_empty(&config.password),
            auth: non_empty(&config.auth),
            identity_token: None,
        })
    }

    /// Resolve to concrete credentials; `None` means anonymous access.
    ///
    /// # Errors
    ///
    /// Returns the keychain's error if the lookup itself fails.
    pub async fn resolve(&self, registry: &str, keychain: &dyn Keychain) -> Result<Option<Credentials>> {
        match self {
            Self::Static(credentials) => Ok(Some(credentials.clone())),
            Self::Keychain => keychain.resolve(registry).await,
        }
    }
}

fn non_empty(field: &Option<String>) -> Option<String> {
    field.clone().filter(|value| !value.is_empty())
}

/// Resolved registry credentials.
#[derive(Clone, Default, PartialEq, Eq, Serialize)]
pub struct Credentials {
    /// Username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Pre-encoded `base64(username:password)`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    /// Identity token issued by a credential helper
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("auth", &self.auth.as_ref().map(|_| "<redacted>"))
            .field("identity_token", &self.identity_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Credentials {
    /// Username/password pair.
    pub fn basic(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
            password: Some(password.into()),
            ..Default::default()
        }
    }

    /// The `auth` field of a docker `config.json` entry.
    ///
    /// Uses the pre-encoded value when present, otherwise encodes
    /// `username:password`.
    pub fn encoded_auth(&self) -> Option<String> {
        if let Some(auth) = &self.auth {
            return Some(auth.clone());
        }
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or_default();
        Some(STANDARD.encode(format!("{}:{}", username, password)))
    }

    /// Split a pre-encoded `auth` value into username and password.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the value is not base64 of
    /// `username:password`.
    pub fn decode_auth(auth: &str) -> Result<Self> {
        let decoded = STANDARD
            .decode(auth.trim())
            .map_err(|e| HarnessError::config(format!("registry auth is not valid base64: {}", e)))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| HarnessError::config("registry auth is not valid UTF-8"))?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or_else(|| HarnessError::config("registry auth must encode username:password"))?;
        Ok(Self {
            auth: Some(auth.trim().to_string()),
            ..Self::basic(username, password)
        })
    }
}

/// Ambient credential store keyed by registry address.
#[async_trait]
pub trait Keychain: Send + Sync {
    /// Look up credentials; `Ok(None)` when the store has none.
    async fn resolve(&self, registry: &str) -> Result<Option<Credentials>>;
}

/// A keychain with no entries; every lookup resolves to anonymous access.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousKeychain;

#[async_trait]
impl Keychain for AnonymousKeychain {
    async fn resolve(&self, _registry: &str) -> Result<Option<Credentials>> {
        Ok(None)
    }
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: BTreeMap<String, DockerAuthEntry>,
    #[serde(default, rename = "credHelpers")]
    cred_helpers: BTreeMap<String, String>,
    #[serde(default, rename = "credsStore")]
    creds_store: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, rename = "identitytoken")]
    identity_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HelperResponse {
    #[serde(rename = "Username", default)]
    username: String,
    #[serde(rename = "Secret", default)]
    secret: String,
}

/// Keychain backed by the docker CLI configuration directory.
#[derive(Debug, Clone)]
pub struct DockerConfigKeychain {
    config_dir: Option<PathBuf>,
}

impl Default for DockerConfigKeychain {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerConfigKeychain {
    /// Use `$DOCKER_CONFIG`, falling back to `~/.docker`.
    pub fn new() -> Self {
        let config_dir = std::env::var_os("DOCKER_CONFIG")
            .map(PathBuf::from)
            .or_else(|| crate::env::home_dir().map(|home| home.join(".docker")));
        Self { config_dir }
    }

    /// Use an explicit configuration directory.
    pub fn with_config_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: Some(dir.into()),
        }
    }

    async fn load(&self) -> Result<Option<DockerConfigFile>> {
        let Some(dir) = &self.config_dir else {
            return Ok(None);
        };
        let path = dir.join("config.json");
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No docker config at {}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| HarnessError::config(format!("malformed {}: {}", path.display(), e)))
    }

    async fn run_helper(&self, helper: &str, registry: &str) -> Result<Option<Credentials>> {
        let program = format!("docker-credential-{}", helper);
        let Ok(binary) = which::which(&program) else {
            warn!("Credential helper {} is not installed", program);
            return Ok(None);
        };

        let server = if registry == DOCKER_HUB {
            DOCKER_HUB_LEGACY
        } else {
            registry
        };

        let mut child = Command::new(binary)
            .arg("get")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(server.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            // Helpers report a miss as a failure with this message.
            let stdout = String::from_utf8_lossy(&output.stdout);
            debug!("{} found no credentials for {}: {}", program, server, stdout.trim());
            return Ok(None);
        }

        let response: HelperResponse = serde_json::from_slice(&output.stdout)
            .map_err(|e| HarnessError::backend(format!("{} returned malformed output: {}", program, e)))?;

        if response.username == "<token>" {
            return Ok(Some(Credentials {
                identity_token: Some(response.secret),
                ..Default::default()
            }));
        }
        Ok(Some(Credentials::basic(response.username, response.secret)))
    }
}

/// Reduce a config.json key (`https://host/v1/`) to a bare registry host.
fn registry_host(key: &str) -> &str {
    let key = key
        .strip_prefix("https://")
        .or_else(|| key.strip_prefix("http://"))
        .unwrap_or(key);
    let host = key.split('/').next().unwrap_or(key);
    if host == "docker.io" || host == "registry-1.docker.io" {
        DOCKER_HUB
    } else {
        host
    }
}

#[async_trait]
impl Keychain for DockerConfigKeychain {
    async fn resolve(&self, registry: &str) -> Result<Option<Credentials>> {
        let Some(config) = self.load().await? else {
            return Ok(None);
        };
        let wanted = registry_host(registry);

        if let Some(helper) = config
            .cred_helpers
            .iter()
            .find(|(key, _)| registry_host(key) == wanted)
            .map(|(_, helper)| helper)
        {
            return self.run_helper(helper, wanted).await;
        }

        if let Some(entry) = config
            .auths
            .iter()
            .find(|(key, _)| registry_host(key) == wanted)
            .map(|(_, entry)| entry)
        {
            if let Some(auth) = entry.auth.as_deref().filter(|a| !a.is_empty()) {
                let mut credentials = Credentials::decode_auth(auth)?;
                credentials.identity_token = entry.identity_token.clone();
                return Ok(Some(credentials));
            }
            if let Some(username) = &entry.username {
                return Ok(Some(Credentials {
                    identity_token: entry.identity_token.clone(),
                    ..Credentials::basic(username.clone(), entry.password.clone().unwrap_or_default())
                }));
            }
            if let Some(token) = &entry.identity_token {
                return Ok(Some(Credentials {
                    identity_token: Some(token.clone()),
                    ..Default::default()
                }));
            }
        }

        if let Some(store) = &config.creds_store {
            return self.run_helper(store, wanted).await;
        }

        debug!("No credentials for {}, using anonymous access", wanted);
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_empty_auth_uses_keychain() {
        assert_eq!(RegistryAuth::from_config(&AuthConfig::default()), RegistryAuth::Keychain);

        let blank = AuthConfig {
            username: Some(String::new()),
            password: None,
            auth: Some(String::new()),
        };
        assert_eq!(RegistryAuth::from_config(&blank), RegistryAuth::Keychain);
    }

    #[test]
    fn test_any_field_means_static() {
        let config = AuthConfig {
            username: Some("ci".to_string()),
            ..Default::default()
        };
        match RegistryAuth::from_config(&config) {
            RegistryAuth::Static(credentials) => {
                assert_eq!(credentials.username.as_deref(), Some("ci"));
                assert_eq!(credentials.password, None);
            }
            other => panic!("expected static credentials, got {:?}", other),
        }
    }

    #[test]
    fn test_encoded_auth() {
        let credentials = Credentials::basic("user", "pass");
        assert_eq!(credentials.encoded_auth().as_deref(), Some("dXNlcjpwYXNz"));

        let decoded = Credentials::decode_auth("dXNlcjpwYXNz").unwrap();
        assert_eq!(decoded.username.as_deref(), Some("user"));
        assert_eq!(decoded.password.as_deref(), Some("pass"));

        assert!(Credentials::decode_auth("not base64!").is_err());
        assert_eq!(Credentials::default().encoded_auth(), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let rendered = format!("{:?}", Credentials::basic("user", "hunter2"));
        assert!(rendered.contains("user"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(registry_host("https://index.docker.io/v1/"), "index.docker.io");
        assert_eq!(registry_host("docker.io"), "index.docker.io");
        assert_eq!(registry_host("cgr.dev"), "cgr.dev");
        assert_eq!(registry_host("http://localhost:5000/v2"), "localhost:5000");
    }

    #[tokio::test]
    async fn test_docker_config_auths() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{
                "auths": {
                    "https://index.docker.io/v1/": { "auth": "dXNlcjpwYXNz" },
                    "ghcr.io": { "username": "bot", "password": "token" }
                }
            }"#,
        )
        .unwrap();
        let keychain = DockerConfigKeychain::with_config_dir(dir.path());

        let hub = keychain.resolve("index.docker.io").await.unwrap().unwrap();
        assert_eq!(hub.username.as_deref(), Some("user"));

        let ghcr = keychain.resolve("ghcr.io").await.unwrap().unwrap();
        assert_eq!(ghcr.password.as_deref(), Some("token"));

        assert!(keychain.resolve("quay.io").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_config_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        let keychain = DockerConfigKeychain::with_config_dir(dir.path());
        assert!(keychain.resolve("cgr.dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_helper_is_anonymous() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("config.json"),
            r#"{ "credHelpers": { "cgr.dev": "testrig-absent-helper" } }"#,
        )
        .unwrap();
        let keychain = DockerConfigKeychain::with_config_dir(dir.path());
        assert!(keychain.resolve("cgr.dev").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_malformed_config() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.json"), "{ not json").unwrap();
        let keychain = DockerConfigKeychain::with_config_dir(dir.path());
        let err = keychain.resolve("cgr.dev").await.unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[tokio::test]
    async fn test_static_resolution_skips_keychain() {
        let auth = RegistryAuth::Static(Credentials::basic("a", "b"));
        let resolved = auth.resolve("cgr.dev", &AnonymousKeychain).await.unwrap();
        assert_eq!(resolved, Some(Credentials::basic("a", "b")));

        let resolved = RegistryAuth::Keychain
            .resolve("cgr.dev", &AnonymousKeychain)
            .await
            .unwrap();
        assert_eq!(resolved, None);
    }
}
