//! Id-keyed store of live harnesses.
//!
//! The registry is constructed explicitly at program start and passed to
//! whatever drives provisioning; it lives for one provisioning run. Entries
//! are added only after a successful start and removed only after a
//! successful teardown, so a failed teardown can be retried through the
//! registry.
//! Each entry sits behind its own async mutex, which is how operations on one
//! harness id are serialized while different harnesses proceed concurrently.

use crate::error::{HarnessError, Result};
use crate::harness::{ExecConfig, ExecOutput, Harness};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A registered harness, locked for the duration of each operation.
pub type SharedHarness = Arc<Mutex<Harness>>;

/// Process-wide mapping from harness id to live harness.
#[derive(Clone, Default)]
pub struct HarnessRegistry {
    harnesses: Arc<DashMap<String, SharedHarness>>,
}

impl HarnessRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a harness and register it under its id.
    ///
    /// Nothing is registered if `start` fails.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] if the id is already
    /// registered, otherwise the start error.
    pub async fn setup(&self, mut harness: Harness, ctx: &CancellationToken) -> Result<SharedHarness> {
        let id = harness.id().to_string();
        if self.harnesses.contains_key(&id) {
            return Err(duplicate(&id));
        }

        harness.start(ctx).await?;

        // Another caller may have registered the same id while we started.
        let mut harness = Some(harness);
        let shared = match self.harnesses.entry(id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => harness.take().map(|harness| {
                let shared = Arc::new(Mutex::new(harness));
                entry.insert(shared.clone());
                shared
            }),
        };

        if let Some(shared) = shared {
            info!("Registered harness {} ({} live)", id, self.len());
            return Ok(shared);
        }

        if let Some(mut harness) = harness {
            if let Err(e) = harness.teardown(ctx).await {
                warn!("Failed to tear down duplicate harness {}: {}", id, e);
            }
        }
        Err(duplicate(&id))
    }

    /// Register an already started harness.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] if the id is already registered.
    pub fn insert(&self, harness: Harness) -> Result<SharedHarness> {
        match self.harnesses.entry(harness.id().to_string()) {
            Entry::Occupied(entry) => Err(duplicate(entry.key())),
            Entry::Vacant(entry) => {
                let shared = Arc::new(Mutex::new(harness));
                entry.insert(shared.clone());
                Ok(shared)
            }
        }
    }

    /// Look up a harness.
    pub fn get(&self, id: &str) -> Option<SharedHarness> {
        self.harnesses.get(id).map(|entry| entry.value().clone())
    }

    /// Unregister a harness without tearing it down.
    pub fn remove(&self, id: &str) -> Option<SharedHarness> {
        self.harnesses.remove(id).map(|(_, harness)| harness)
    }

    /// Run a command in a registered harness.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::InvalidState`] if the id is unknown, otherwise
    /// the exec error.
    pub async fn exec(&self, id: &str, ctx: &CancellationToken, config: &ExecConfig) -> Result<ExecOutput> {
        let harness = self.get(id).ok_or_else(|| unknown(id, "exec"))?;
        let mut harness = harness.lock().await;
        harness.exec(ctx, config).await
    }

    /// Tear a harness down and unregister it.
    ///
    /// Unknown ids succeed: the harness is already gone.
    ///
    /// # Errors
    ///
    /// Returns the teardown error; the harness stays registered so the
    /// teardown can be retried.
    pub async fn teardown(&self, id: &str, ctx: &CancellationToken) -> Result<()> {
        let Some(shared) = self.get(id) else {
            debug!("Harness {} is not registered, nothing to tear down", id);
            return Ok(());
        };

        let mut harness = shared.lock().await;
        if let Err(e) = harness.teardown(ctx).await {
            warn!("Teardown of harness {} failed, keeping it registered: {}", id, e);
            return Err(e);
        }
        drop(harness);

        self.harnesses
            .remove_if(id, |_, entry| Arc::ptr_eq(entry, &shared));
        info!("Unregistered harness {} ({} live)", id, self.len());
        Ok(())
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.harnesses.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered harnesses.
    pub fn len(&self) -> usize {
        self.harnesses.len()
    }

    /// Whether no harness is registered.
    pub fn is_empty(&self) -> bool {
        self.harnesses.is_empty()
    }
}

fn duplicate(id: &str) -> HarnessError {
    HarnessError::InvalidState {
        operation: "register",
        state: format!("already registered as {:?}", id),
    }
}

fn unknown(id: &str, operation: &'static str) -> HarnessError {
    HarnessError::InvalidState {
        operation,
        state: format!("not registered ({:?})", id),
    }
}
