//! Environment request model.
//!
//! A [`ContainerRequest`] is the validated description of a desired
//! environment. It is produced by the composer and consumed by a runtime
//! backend's `start`.

use crate::compose::reference::ImageRef;
use crate::error::{HarnessError, Result};
use crate::harness::archive;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::sync::LazyLock;

static USER: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[0-9]+:[0-9]+$").expect("static user pattern compiles"));

/// Environment variables with unique keys, kept in key order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Env(BTreeMap<String, String>);

impl Env {
    /// Create an empty set of variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from pairs, rejecting duplicate or malformed keys.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] naming the offending key.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut env = Self::new();
        for (key, value) in pairs {
            let key = key.into();
            validate_key(&key)?;
            if env.0.contains_key(&key) {
                return Err(HarnessError::config(format!(
                    "duplicate environment variable {:?}",
                    key
                )));
            }
            env.0.insert(key, value.into());
        }
        Ok(env)
    }

    /// Set a variable, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the key is empty or contains `=`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let key = key.into();
        validate_key(&key)?;
        self.0.insert(key, value.into());
        Ok(())
    }

    /// Overlay `other` on top of this set; `other` wins on collisions.
    pub fn extend(&mut self, other: &Env) {
        self.0
            .extend(other.0.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    /// Look up a variable.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Number of variables.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no variables are set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Render as `KEY=VALUE` entries in key order.
    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(HarnessError::config("environment variable name is empty"));
    }
    if key.contains('=') || key.contains('\0') {
        return Err(HarnessError::config(format!(
            "invalid environment variable name {:?}",
            key
        )));
    }
    Ok(())
}

/// A file to inject into a running environment.
///
/// Only the base name of `target` survives archiving; the archive is
/// extracted into [`File::parent_dir`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    /// File contents
    pub contents: Vec<u8>,
    /// Absolute target path inside the environment
    pub target: String,
    /// Permission bits
    pub mode: u32,
}

impl File {
    /// Create a file from in-memory contents.
    pub fn new(contents: impl Into<Vec<u8>>, target: impl Into<String>, mode: u32) -> Self {
        Self {
            contents: contents.into(),
            target: target.into(),
            mode,
        }
    }

    /// Create a file by draining a reader.
    ///
    /// # Errors
    ///
    /// Returns an IO error if reading fails.
    pub fn from_reader<R: Read>(
        mut reader: R,
        target: impl Into<String>,
        mode: u32,
    ) -> Result<Self> {
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents)?;
        Ok(Self::new(contents, target, mode))
    }

    /// Package this file as a single-entry compressed archive.
    ///
    /// # Errors
    ///
    /// Returns an IO error if archiving fails.
    pub fn archive(&self) -> Result<Vec<u8>> {
        Ok(archive::package(
            self.contents.as_slice(),
            &self.target,
            self.mode,
        )?)
    }

    /// Directory the archive has to be extracted into.
    pub fn parent_dir(&self) -> &str {
        match Path::new(&self.target).parent().and_then(Path::to_str) {
            Some("") | None => "/",
            Some(parent) => parent,
        }
    }
}

/// Validated description of a desired environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContainerRequest {
    /// Image reference
    pub image: String,
    /// Entrypoint override
    pub entrypoint: Vec<String>,
    /// User as `uid:gid`
    pub user: Option<String>,
    /// Environment variables
    pub env: Env,
    /// Command
    pub cmd: Vec<String>,
    /// Networks to attach to
    pub networks: Vec<String>,
    /// Run privileged
    pub privileged: bool,
    /// Files injected after creation
    #[serde(skip)]
    pub files: Vec<File>,
}

impl ContainerRequest {
    /// Create a new request builder.
    pub fn builder() -> ContainerRequestBuilder {
        ContainerRequestBuilder::new()
    }

    /// Parsed image reference.
    ///
    /// # Errors
    ///
    /// Returns a config error if the image is malformed.
    pub fn image_ref(&self) -> Result<ImageRef> {
        ImageRef::parse(&self.image)
    }
}

/// Builder for [`ContainerRequest`]; validation happens in [`build`](Self::build).
#[derive(Debug, Default)]
pub struct ContainerRequestBuilder {
    image: Option<String>,
    entrypoint: Vec<String>,
    user: Option<String>,
    env: Vec<(String, String)>,
    cmd: Vec<String>,
    networks: Vec<String>,
    privileged: bool,
    files: Vec<File>,
}

impl ContainerRequestBuilder {
    /// Create a new request builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the image.
    pub fn image<S: Into<String>>(mut self, image: S) -> Self {
        self.image = Some(image.into());
        self
    }

    /// Set the entrypoint.
    pub fn entrypoint<I, S>(mut self, entrypoint: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.entrypoint = entrypoint.into_iter().map(Into::into).collect();
        self
    }

    /// Set the user (`uid:gid`).
    pub fn user<S: Into<String>>(mut self, user: S) -> Self {
        self.user = Some(user.into());
        self
    }

    /// Add an environment variable.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add every variable of an [`Env`].
    pub fn envs(mut self, env: &Env) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    /// Set the command.
    pub fn cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Attach to a network.
    pub fn network<S: Into<String>>(mut self, network: S) -> Self {
        self.networks.push(network.into());
        self
    }

    /// Run privileged.
    pub fn privileged(mut self, enable: bool) -> Self {
        self.privileged = enable;
        self
    }

    /// Inject a file.
    pub fn file(mut self, file: File) -> Self {
        self.files.push(file);
        self
    }

    /// Validate and build the request.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] if the image is missing or malformed,
    /// the user is not `uid:gid`, or an environment key repeats.
    pub fn build(self) -> Result<ContainerRequest> {
        let image = self
            .image
            .ok_or_else(|| HarnessError::config("Image is required"))?;
        ImageRef::parse(&image)?;

        if let Some(user) = &self.user {
            if !USER.is_match(user) {
                return Err(HarnessError::config(format!(
                    "invalid user {:?}: expected uid:gid",
                    user
                )));
            }
        }

        let env = Env::from_pairs(self.env)?;

        Ok(ContainerRequest {
            image,
            entrypoint: self.entrypoint,
            user: self.user,
            env,
            cmd: self.cmd,
            networks: self.networks,
            privileged: self.privileged,
            files: self.files,
        })
    }
}
