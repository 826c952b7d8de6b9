//! Backend adapters: one per driver, wrapping discovery and handle lifetime.
//!
//! An adapter turns what a [`HalDriver`] reports into [`DeviceDescriptor`]s
//! with contiguous ordinals, opens [`DeviceHandle`]s on request and closes
//! them exactly once. It also names the plugin loader for its devices.

pub mod amdgpu;
pub mod host;

pub use amdgpu::AmdGpuAdapter;
pub use host::HostCpuAdapter;

use crate::device::{BackendKind, DeviceCapabilities, DeviceDescriptor, DeviceHandle, DeviceId};
use crate::error::SystemError;
use crate::hal::{HalDriver, PluginLoader, RawDeviceInfo};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// Discovery and handle lifetime for one backend kind.
pub trait DeviceDriverAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Enumerates devices. Driver initialization failures map to
    /// `BackendUnavailable`. Ordinals are contiguous from 0 in driver order.
    fn discover(&self) -> Result<Vec<DeviceDescriptor>, SystemError>;

    /// Opens a discovered device. Driver failures map to `DeviceOpen`.
    fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle, SystemError>;

    /// Closes a handle. Idempotent; driver errors are logged.
    fn close(&self, handle: &DeviceHandle);

    fn plugin_loader(&self) -> Arc<dyn PluginLoader>;
}

/// When a backend's devices are opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpenPolicy {
    /// During `build`; an open failure is a build failure.
    Eager,
    /// On first use; an open failure leaves the device out.
    Lazy,
}

/// How the factory treats one backend kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendPolicy {
    pub kind: BackendKind,
    /// A required backend that yields no open device fails the build.
    pub required: bool,
    pub open: OpenPolicy,
}

impl BackendPolicy {
    /// Built-in policy for a backend kind.
    pub fn default_for(kind: BackendKind) -> Self {
        match kind {
            BackendKind::HostCpu => Self {
                kind,
                required: true,
                open: OpenPolicy::Eager,
            },
            BackendKind::AmdGpu => Self {
                kind,
                required: false,
                open: OpenPolicy::Lazy,
            },
        }
    }
}

/// Shared discovery/open/close logic over a `HalDriver`.
///
/// Adapters keep the backend-specific parts (filtering, capability
/// overrides) and delegate the rest here.
pub(crate) struct DriverBinding {
    kind: BackendKind,
    driver: Arc<dyn HalDriver>,
    /// Raw infos of the last discovery, indexed by ordinal
    discovered: std::sync::Mutex<Vec<RawDeviceInfo>>,
}

impl DriverBinding {
    pub(crate) fn new(kind: BackendKind, driver: Arc<dyn HalDriver>) -> Self {
        Self {
            kind,
            driver,
            discovered: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn probe(&self) -> Result<Vec<RawDeviceInfo>, SystemError> {
        self.driver
            .probe_devices()
            .map_err(|e| SystemError::BackendUnavailable {
                kind: self.kind,
                reason: e.to_string(),
            })
    }

    /// Assigns ordinals to the infos that survived filtering.
    pub(crate) fn describe(
        &self,
        infos: Vec<RawDeviceInfo>,
        concurrency: impl Fn(&RawDeviceInfo) -> usize,
    ) -> Vec<DeviceDescriptor> {
        let descriptors = infos
            .iter()
            .enumerate()
            .map(|(ordinal, info)| DeviceDescriptor {
                id: DeviceId::new(self.kind, ordinal as u32),
                identity: info.identity.clone(),
                name: info.name.clone(),
                capabilities: DeviceCapabilities {
                    supports_plugins: info.supports_plugins,
                    concurrency: concurrency(info).max(1),
                },
            })
            .collect();
        debug!(
            "Driver {} reported {} {} device(s)",
            self.driver.name(),
            infos.len(),
            self.kind
        );
        *self
            .discovered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = infos;
        descriptors
    }

    pub(crate) fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle, SystemError> {
        let open_error = |reason: String| SystemError::DeviceOpen {
            device: descriptor.id,
            reason,
        };
        if descriptor.kind() != self.kind {
            return Err(open_error(format!("not a {} device", self.kind)));
        }
        let info = self
            .discovered
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(descriptor.id.ordinal as usize)
            .filter(|info| info.identity == descriptor.identity)
            .cloned()
            .ok_or_else(|| open_error("device was not discovered by this adapter".to_string()))?;

        let raw = self
            .driver
            .open(&info)
            .map_err(|e| open_error(e.to_string()))?;
        debug!("Opened {} ({})", descriptor.id, descriptor.identity);
        Ok(DeviceHandle::new(descriptor.clone(), raw, self.driver.clone()))
    }

    pub(crate) fn close(&self, handle: &DeviceHandle) {
        match handle.close() {
            Ok(true) => debug!("Closed {}", handle.id()),
            Ok(false) => {}
            Err(e) => warn!("Error closing {}: {}", handle.id(), e),
        }
    }
}
