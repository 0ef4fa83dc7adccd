//! Image reference parsing.
//!
//! Accepts `[registry/]repository[:tag][@digest]` references and resolves the
//! registry address used for credential lookups.

use crate::error::{HarnessError, Result};
use regex::Regex;
use serde::Serialize;
use std::fmt;
use std::sync::LazyLock;

/// Registry assumed when a reference names none.
pub const DEFAULT_REGISTRY: &str = "index.docker.io";

static PATH_COMPONENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]+(?:(?:[._]|__|-+)[a-z0-9]+)*$").expect("static reference pattern compiles"));

static TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}$").expect("static reference pattern compiles"));

static DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9]*(?:[-_+.][A-Za-z][A-Za-z0-9]*)*:[0-9a-fA-F]{32,}$").expect("static reference pattern compiles")
});

static REGISTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9](?:[A-Za-z0-9.-]*[A-Za-z0-9])?(?::[0-9]+)?$").expect("static reference pattern compiles")
});

/// A parsed container image reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageRef {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<String>,
}

impl ImageRef {
    /// Parse an image reference.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::Config`] naming the reference when any part is
    /// malformed.
    pub fn parse(reference: &str) -> Result<Self> {
        let invalid = |why: &str| {
            HarnessError::config(format!("invalid image reference {:?}: {}", reference, why))
        };

        if reference.trim().is_empty() {
            return Err(HarnessError::config("image reference is empty"));
        }
        if reference != reference.trim() {
            return Err(invalid("surrounding whitespace"));
        }

        let (name, digest) = match reference.split_once('@') {
            Some((name, digest)) => {
                if !DIGEST.is_match(digest) {
                    return Err(invalid("malformed digest"));
                }
                (name, Some(digest.to_string()))
            }
            None => (reference, None),
        };

        // A tag separator only counts after the last path separator, so
        // registry ports are not mistaken for tags.
        let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
        let (name, tag) = match name[last_slash..].rfind(':') {
            Some(i) => {
                let split = last_slash + i;
                let tag = &name[split + 1..];
                if !TAG.is_match(tag) {
                    return Err(invalid("malformed tag"));
                }
                (&name[..split], Some(tag.to_string()))
            }
            None => (name, None),
        };

        let mut components: Vec<&str> = name.split('/').collect();
        let registry = if components.len() > 1
            && (components[0].contains('.')
                || components[0].contains(':')
                || components[0] == "localhost")
        {
            let registry = components.remove(0);
            if !REGISTRY.is_match(registry) {
                return Err(invalid("malformed registry host"));
            }
            registry.to_string()
        } else {
            DEFAULT_REGISTRY.to_string()
        };

        if components.is_empty() || components.iter().any(|c| !PATH_COMPONENT.is_match(c)) {
            return Err(invalid("repository must be lowercase path components"));
        }

        let mut repository = components.join("/");
        if registry == DEFAULT_REGISTRY && components.len() == 1 {
            repository = format!("library/{}", repository);
        }

        Ok(Self {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Registry address used for pulls and credential lookups.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// Repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Tag, if one was given.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// Digest, if the reference is digest-pinned.
    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{}", digest)?;
        }
        Ok(())
    }
}
