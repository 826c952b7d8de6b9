//! System configuration and runtime constants.
//!
//! A [`SystemConfig`] decides which backends a `SystemFactory` probes and
//! how each one is constructed. It is plain data: two systems built from
//! different configurations can coexist in one process.
//!
//! # File format
//!
//! ```json
//! {
//!   "backends": ["host", "amdgpu"],
//!   "host": { "worker_threads": 8, "split_numa": false },
//!   "amdgpu": { "device_mask": 3, "library": "/opt/rocm/lib/libamdhip64.so" },
//!   "scheduler": "dedicated"
//! }
//! ```

use crate::device::BackendKind;
use crate::error::SystemError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// =============================================================================
// Plugin ABI
// =============================================================================

/// Plugin ABI version the host loader accepts.
///
/// Host plugins export `localrt_plugin_abi_version() -> u32` returning this.
pub const PLUGIN_ABI_VERSION: u32 = 1;

/// Symbol host plugins export to report their ABI version.
pub const PLUGIN_ABI_SYMBOL: &[u8] = b"localrt_plugin_abi_version\0";

// =============================================================================
// HIP runtime
// =============================================================================

/// Library names tried in order when no explicit HIP library is configured.
#[cfg(target_os = "windows")]
pub const HIP_LIBRARY_NAMES: &[&str] = &["amdhip64_6.dll", "amdhip64.dll"];
#[cfg(not(target_os = "windows"))]
pub const HIP_LIBRARY_NAMES: &[&str] = &["libamdhip64.so", "libamdhip64.so.6", "libamdhip64.so.5"];

/// Environment variable overriding the HIP library path.
pub const HIP_LIBRARY_ENV: &str = "LOCALRT_HIP_LIBRARY";

// =============================================================================
// Configuration
// =============================================================================

/// How a system obtains its task-scheduling facility.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// Each system owns a worker pool, torn down with the system.
    #[default]
    Dedicated,
    /// Systems share one process-wide worker pool.
    Global,
}

/// Construction parameters for the host CPU backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCpuConfig {
    /// Worker threads per host device. Defaults to the logical CPU count
    /// of the device (whole host or NUMA node).
    pub worker_threads: Option<usize>,
    /// Expose one host device per NUMA node instead of a single device.
    pub split_numa: bool,
}

/// Construction parameters for the AMD GPU backend.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmdGpuConfig {
    /// Bit `i` selects HIP device `i`. `None` selects every device.
    pub device_mask: Option<u64>,
    /// Explicit path to the HIP runtime library.
    pub library: Option<PathBuf>,
}

impl AmdGpuConfig {
    /// Whether HIP device `index` passes the selection mask.
    pub fn selects(&self, index: u32) -> bool {
        match self.device_mask {
            None => true,
            Some(mask) => index < 64 && mask & (1u64 << index) != 0,
        }
    }
}

/// Configuration consumed by `SystemFactory::build`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Enabled backends. Accelerators are probed in this order, after the host.
    pub backends: Vec<BackendKind>,
    pub host: HostCpuConfig,
    pub amdgpu: AmdGpuConfig,
    pub scheduler: SchedulerMode,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            backends: vec![BackendKind::HostCpu],
            host: HostCpuConfig::default(),
            amdgpu: AmdGpuConfig::default(),
            scheduler: SchedulerMode::default(),
        }
    }
}

impl SystemConfig {
    /// Host-only configuration.
    pub fn host_only() -> Self {
        Self::default()
    }

    /// Enables an additional backend (no-op if already enabled).
    pub fn with_backend(mut self, kind: BackendKind) -> Self {
        if !self.backends.contains(&kind) {
            self.backends.push(kind);
        }
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.host.worker_threads = Some(threads);
        self
    }

    pub fn with_scheduler(mut self, mode: SchedulerMode) -> Self {
        self.scheduler = mode;
        self
    }

    /// Parses and validates a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self, SystemError> {
        let config: SystemConfig = serde_json::from_str(json)
            .map_err(|e| SystemError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SystemError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SystemError::InvalidConfig(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&json)
    }

    /// Rejects configurations that cannot produce a meaningful system.
    pub fn validate(&self) -> Result<(), SystemError> {
        if self.backends.is_empty() {
            return Err(SystemError::InvalidConfig(
                "at least one backend must be enabled".to_string(),
            ));
        }
        if self.host.worker_threads == Some(0) {
            return Err(SystemError::InvalidConfig(
                "host.worker_threads must be greater than zero".to_string(),
            ));
        }
        if self.amdgpu.device_mask == Some(0) {
            return Err(SystemError::InvalidConfig(
                "amdgpu.device_mask selects no devices".to_string(),
            ));
        }
        Ok(())
    }

    /// Enabled backends in probe order: host first, then accelerators in
    /// the order they were enabled. Duplicates are dropped.
    pub fn probe_order(&self) -> Vec<BackendKind> {
        let mut order = Vec::with_capacity(self.backends.len());
        if self.backends.contains(&BackendKind::HostCpu) {
            order.push(BackendKind::HostCpu);
        }
        for kind in &self.backends {
            if kind.is_accelerator() && !order.contains(kind) {
                order.push(*kind);
            }
        }
        order
    }
}
