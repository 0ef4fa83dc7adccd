//! Mount descriptors and the volume client boundary.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Kind of storage attached to a harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountKind {
    /// Host path bind mount
    Bind,
    /// Named persistent volume
    Volume,
}

impl fmt::Display for MountKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountKind::Bind => write!(f, "bind"),
            MountKind::Volume => write!(f, "volume"),
        }
    }
}

/// A resolved attachment of storage into a harness filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    /// Mount type
    pub kind: MountKind,
    /// Host path or volume name
    pub source: String,
    /// Mountpoint inside the harness
    pub target: String,
    /// Volume labels (empty for binds)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Mount read-only
    #[serde(default)]
    pub read_only: bool,
}

impl Mount {
    /// A read-write bind mount.
    pub fn bind(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into(),
            target: target.into(),
            labels: BTreeMap::new(),
            read_only: false,
        }
    }

    /// A read-write volume mount.
    pub fn volume(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Volume,
            source: source.into(),
            target: target.into(),
            labels: BTreeMap::new(),
            read_only: false,
        }
    }
}

/// Request for a named persistent volume.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeRequest {
    /// Volume name; the backend assigns one when empty
    pub name: String,
    /// Mountpoint the volume will be attached at
    pub target: String,
    /// Caller-supplied labels
    pub labels: BTreeMap<String, String>,
}

impl VolumeRequest {
    /// Request a volume with a backend-assigned name.
    pub fn anonymous(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            ..Default::default()
        }
    }

    /// Request a volume with a fixed name.
    pub fn named(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Add a label.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Creates and removes named persistent volumes.
///
/// Implementations attach the caller's labels to the created resource and
/// return a [`Mount`] whose labels also include
/// [`default_labels`](crate::env::default_labels).
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Create a volume and describe how to mount it.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`](crate::HarnessError::Backend) if
    /// creation fails.
    async fn create_volume(&self, request: &VolumeRequest) -> Result<Mount>;

    /// Force-remove the volume behind a mount.
    ///
    /// Removing a volume that does not exist is an error.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Backend`](crate::HarnessError::Backend) if
    /// removal fails.
    async fn remove_volume(&self, mount: &Mount) -> Result<()>;
}
