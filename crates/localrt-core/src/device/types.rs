//! Core device types: backend kinds, device identities, and descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Class of compute device a backend drives.
///
/// Kinds are ordered by probe priority: `HostCpu` is always probed first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    /// Host CPU task pool (local-task driver).
    HostCpu,
    /// AMD GPU driven through HIP.
    AmdGpu,
}

impl BackendKind {
    /// Short stable name used in device ids and configuration files.
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::HostCpu => "host",
            BackendKind::AmdGpu => "amdgpu",
        }
    }

    /// Whether this kind is an accelerator (anything but the host).
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, BackendKind::HostCpu)
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    /// Parses a backend name.
    ///
    /// Accepts HAL target device spellings as well as the short names:
    /// `local`, `local-task`, `local-sync` and `llvm-cpu` all select the host.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        match name.as_str() {
            "host" | "cpu" | "llvm-cpu" => Ok(BackendKind::HostCpu),
            n if n == "local" || n.starts_with("local-") => Ok(BackendKind::HostCpu),
            "amdgpu" | "hip" | "rocm" => Ok(BackendKind::AmdGpu),
            _ => Err(format!("unknown backend kind '{}'", s)),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> String {
        kind.as_str().to_string()
    }
}

/// Identity of a device within one `System`: backend kind plus ordinal.
///
/// Ordinals are contiguous from 0 per kind, in driver report order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub kind: BackendKind,
    pub ordinal: u32,
}

impl DeviceId {
    pub fn new(kind: BackendKind, ordinal: u32) -> Self {
        Self { kind, ordinal }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.ordinal)
    }
}

impl FromStr for DeviceId {
    type Err = String;

    /// Parses `kind:ordinal`, or a bare kind meaning ordinal 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, ordinal) = match s.rsplit_once(':') {
            Some((kind, ordinal)) => {
                let ordinal = ordinal
                    .parse::<u32>()
                    .map_err(|_| format!("invalid device ordinal in '{}'", s))?;
                (kind, ordinal)
            }
            None => (s, 0),
        };
        Ok(DeviceId::new(kind.parse()?, ordinal))
    }
}

/// Capability flags reported at discovery time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Whether executable plugins can be loaded onto this device.
    pub supports_plugins: bool,
    /// Number of work items the device executes concurrently
    /// (worker threads for the host, command queues for a GPU).
    pub concurrency: usize,
}

/// Immutable description of a discovered device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    /// Driver-specific identity (`host:node0`, `hip:3`).
    pub identity: String,
    /// Human readable device name.
    pub name: String,
    pub capabilities: DeviceCapabilities,
}

impl DeviceDescriptor {
    pub fn kind(&self) -> BackendKind {
        self.id.kind
    }
}
