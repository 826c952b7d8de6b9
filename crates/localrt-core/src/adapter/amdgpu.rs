//! AMD GPU adapter over the HIP driver.

use super::{DeviceDriverAdapter, DriverBinding};
use crate::config::AmdGpuConfig;
use crate::device::{BackendKind, DeviceDescriptor, DeviceHandle};
use crate::error::SystemError;
#[cfg(feature = "amdgpu")]
use crate::hal::hip::{HipDriver, HipModuleLoader};
use crate::hal::{HalDriver, PluginLoader};
use std::sync::Arc;
use tracing::debug;

/// Adapter for AMD GPUs.
///
/// Devices not selected by `device_mask` are dropped before ordinals are
/// assigned, so the visible GPUs are always `amdgpu:0..n`. The HIP-backed
/// constructor needs the `amdgpu` feature; `with_driver` is always there.
pub struct AmdGpuAdapter {
    binding: DriverBinding,
    loader: Arc<dyn PluginLoader>,
    config: AmdGpuConfig,
}

impl AmdGpuAdapter {
    #[cfg(feature = "amdgpu")]
    pub fn new(config: &AmdGpuConfig) -> Self {
        let driver = Arc::new(HipDriver::new(config.library.clone()));
        let loader = Arc::new(HipModuleLoader::new(driver.clone()));
        Self::with_driver(driver, loader, config.clone())
    }

    /// Builds the adapter over an arbitrary driver and loader.
    pub fn with_driver(
        driver: Arc<dyn HalDriver>,
        loader: Arc<dyn PluginLoader>,
        config: AmdGpuConfig,
    ) -> Self {
        Self {
            binding: DriverBinding::new(BackendKind::AmdGpu, driver),
            loader,
            config,
        }
    }
}

impl DeviceDriverAdapter for AmdGpuAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::AmdGpu
    }

    fn discover(&self) -> Result<Vec<DeviceDescriptor>, SystemError> {
        let infos = self.binding.probe()?;
        let total = infos.len();
        let selected: Vec<_> = infos
            .into_iter()
            .filter(|info| self.config.selects(info.index))
            .collect();
        if selected.len() != total {
            debug!(
                "device_mask selected {} of {} HIP devices",
                selected.len(),
                total
            );
        }
        Ok(self.binding.describe(selected, |info| info.concurrency))
    }

    fn open(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle, SystemError> {
        self.binding.open(descriptor)
    }

    fn close(&self, handle: &DeviceHandle) {
        self.binding.close(handle)
    }

    fn plugin_loader(&self) -> Arc<dyn PluginLoader> {
        self.loader.clone()
    }
}
