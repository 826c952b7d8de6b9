//! Plugin residency tracking.

use super::artifact::{ArtifactId, ExecutableArtifact, LoadedRef};
use crate::device::{BackendKind, DeviceHandle, DeviceId};
use crate::error::SystemError;
use crate::hal::{PluginLoader, PluginToken};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct Residency {
    device: DeviceId,
    token: PluginToken,
    generation: u64,
    loader: Arc<dyn PluginLoader>,
}

/// Loads executables onto devices and tracks where each one lives.
///
/// An artifact identity is resident on at most one device: loading an
/// identity again evicts the previous residency before the new load.
#[derive(Default)]
pub struct ExecutableLoadingService {
    loaders: HashMap<BackendKind, Arc<dyn PluginLoader>>,
    resident: HashMap<ArtifactId, Residency>,
    next_generation: u64,
}

impl ExecutableLoadingService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the plugin loader used for devices of `kind`.
    pub fn register_loader(&mut self, kind: BackendKind, loader: Arc<dyn PluginLoader>) {
        self.loaders.insert(kind, loader);
    }

    /// Loads `artifact` onto the device behind `handle`.
    ///
    /// # Errors
    ///
    /// - `BackendMismatch` if the artifact targets another backend kind
    /// - `LoadFailure` if the device takes no plugins, is closed, or the
    ///   loader rejects the image
    pub fn load(
        &mut self,
        artifact: &ExecutableArtifact,
        handle: &DeviceHandle,
    ) -> Result<LoadedRef, SystemError> {
        if artifact.kind != handle.kind() {
            return Err(SystemError::BackendMismatch {
                artifact: artifact.id.clone(),
                artifact_kind: artifact.kind,
                device_kind: handle.kind(),
            });
        }

        let failure = |reason: String| SystemError::LoadFailure {
            artifact: artifact.id.clone(),
            reason,
        };
        if !handle.descriptor().capabilities.supports_plugins {
            return Err(failure(format!("device {} does not support plugins", handle.id())));
        }
        if handle.is_closed() {
            return Err(failure(format!("device {} is closed", handle.id())));
        }
        let loader = self
            .loaders
            .get(&handle.kind())
            .cloned()
            .ok_or_else(|| failure(format!("no plugin loader for {}", handle.kind())))?;

        if let Some(previous) = self.resident.remove(&artifact.id) {
            debug!(
                "Evicting '{}' from {} before reload",
                artifact.id, previous.device
            );
            Self::release(&artifact.id, previous);
        }

        let token = loader
            .load(&artifact.image, handle.raw())
            .map_err(|e| failure(e.to_string()))?;

        self.next_generation += 1;
        let generation = self.next_generation;
        self.resident.insert(
            artifact.id.clone(),
            Residency {
                device: handle.id(),
                token,
                generation,
                loader,
            },
        );
        info!("Loaded '{}' onto {}", artifact.id, handle.id());

        Ok(LoadedRef::new(artifact.id.clone(), handle.id(), generation))
    }

    /// Unloads a residency. Returns whether anything was unloaded.
    ///
    /// Unloading twice, or unloading a reference superseded by a later
    /// load of the same identity, does nothing.
    pub fn unload(&mut self, loaded: &LoadedRef) -> bool {
        let current = self
            .resident
            .get(loaded.artifact())
            .is_some_and(|r| r.generation == loaded.generation());
        if !current {
            debug!("Ignoring unload of stale reference to '{}'", loaded.artifact());
            return false;
        }
        if let Some(residency) = self.resident.remove(loaded.artifact()) {
            Self::release(loaded.artifact(), residency);
        }
        true
    }

    /// Unloads every residency. Returns how many were unloaded.
    pub fn unload_all(&mut self) -> usize {
        let count = self.resident.len();
        for (id, residency) in self.resident.drain() {
            Self::release(&id, residency);
        }
        count
    }

    pub fn residency_count(&self) -> usize {
        self.resident.len()
    }

    /// Device the identity is currently resident on.
    pub fn resident_device(&self, id: &ArtifactId) -> Option<DeviceId> {
        self.resident.get(id).map(|r| r.device)
    }

    fn release(id: &ArtifactId, residency: Residency) {
        match residency.loader.unload(residency.token) {
            Ok(()) => info!("Unloaded '{}' from {}", id, residency.device),
            Err(e) => warn!("Failed to unload '{}' from {}: {}", id, residency.device, e),
        }
    }
}
