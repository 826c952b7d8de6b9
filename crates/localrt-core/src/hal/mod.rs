//! Narrow interfaces onto the external HAL drivers and plugin loaders.
//!
//! The system manager never talks to a driver directly: adapters consume a
//! [`HalDriver`] for discovery and handle lifetime, and a [`PluginLoader`]
//! for executable residency. Two bindings ship with the crate:
//!
//! - [`host`]: the task-based host CPU driver and a shared-library loader
//! - `hip`: the HIP runtime bound at load time (feature `amdgpu`)

pub mod host;
#[cfg(feature = "amdgpu")]
pub mod hip;

use crate::error::HalError;
use crate::executable::ArtifactImage;

/// Opaque driver-level handle to an opened device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RawHandle(pub u64);

/// Opaque token returned by a plugin loader for one loaded image.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PluginToken(pub u64);

/// A device as reported by a driver probe, before ordinals are assigned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDeviceInfo {
    /// Driver-specific identity (`host:node0`, `hip:3`).
    pub identity: String,
    pub name: String,
    /// Driver-local index the identity refers to.
    pub index: u32,
    /// Execution width the driver advertises.
    pub concurrency: usize,
    pub supports_plugins: bool,
}

/// Device discovery and handle lifetime for one backend driver.
pub trait HalDriver: Send + Sync {
    /// Driver name for logs.
    fn name(&self) -> &str;

    /// Enumerates available devices in a stable order.
    ///
    /// Returns `HalError::Unavailable` when the driver cannot initialize.
    fn probe_devices(&self) -> Result<Vec<RawDeviceInfo>, HalError>;

    /// Opens a device, allocating driver resources for it.
    fn open(&self, device: &RawDeviceInfo) -> Result<RawHandle, HalError>;

    /// Releases the resources of an opened device.
    fn close(&self, handle: RawHandle) -> Result<(), HalError>;
}

/// Loads compiled executables onto opened devices.
pub trait PluginLoader: Send + Sync {
    fn load(&self, image: &ArtifactImage, device: RawHandle) -> Result<PluginToken, HalError>;

    fn unload(&self, token: PluginToken) -> Result<(), HalError>;
}
