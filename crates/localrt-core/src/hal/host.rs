//! Host CPU driver binding and shared-library plugin loader.
//!
//! The host "driver" has no external runtime to talk to: a device is a
//! slice of the host's logical CPUs, and opening one only allocates a
//! handle. Worker threads are created by the scheduler when the device's
//! execution context is attached, not here.

use super::{HalDriver, PluginLoader, PluginToken, RawDeviceInfo, RawHandle};
use crate::config::{PLUGIN_ABI_SYMBOL, PLUGIN_ABI_VERSION};
use crate::error::HalError;
use crate::executable::ArtifactImage;
use libloading::Library;
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tempfile::TempPath;
use tracing::{debug, warn};

/// Linux sysfs directory listing NUMA nodes.
const NUMA_SYSFS: &str = "/sys/devices/system/node";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Task-based host CPU driver.
///
/// Reports a single device covering every logical CPU, or one device per
/// NUMA node when `split_numa` is set and the topology is readable.
pub struct HostTaskDriver {
    split_numa: bool,
    numa_root: PathBuf,
    next: AtomicU64,
    open: Mutex<HashSet<u64>>,
}

impl HostTaskDriver {
    pub fn new(split_numa: bool) -> Self {
        Self::with_numa_root(split_numa, NUMA_SYSFS)
    }

    /// Reads NUMA topology from `root` instead of sysfs.
    pub fn with_numa_root(split_numa: bool, root: impl Into<PathBuf>) -> Self {
        Self {
            split_numa,
            numa_root: root.into(),
            next: AtomicU64::new(1),
            open: Mutex::new(HashSet::new()),
        }
    }

    fn whole_host() -> RawDeviceInfo {
        let threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        RawDeviceInfo {
            identity: "host:all".to_string(),
            name: format!("Host CPU ({} threads)", threads),
            index: 0,
            concurrency: threads,
            supports_plugins: true,
        }
    }

    /// Lists `(node, cpu count)` pairs sorted by node number.
    fn numa_nodes(&self) -> Result<Vec<(u32, usize)>, HalError> {
        let mut nodes = Vec::new();
        for entry in std::fs::read_dir(&self.numa_root)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(node) = name
                .to_str()
                .and_then(|n| n.strip_prefix("node"))
                .and_then(|n| n.parse::<u32>().ok())
            else {
                continue;
            };
            let cpulist = std::fs::read_to_string(entry.path().join("cpulist"))?;
            let cpus = parse_cpulist(&cpulist)?;
            // Memory-only nodes have no CPUs to run work on
            if cpus > 0 {
                nodes.push((node, cpus));
            }
        }
        nodes.sort_unstable();
        Ok(nodes)
    }
}

/// Counts the CPUs in a sysfs cpulist such as `0-3,8-11`.
pub fn parse_cpulist(list: &str) -> Result<usize, HalError> {
    let invalid = || HalError::Io(format!("malformed cpulist '{}'", list.trim()));
    let mut count = 0;
    for range in list.trim().split(',').filter(|r| !r.is_empty()) {
        count += match range.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.parse().map_err(|_| invalid())?;
                let hi: usize = hi.parse().map_err(|_| invalid())?;
                if hi < lo {
                    return Err(invalid());
                }
                hi - lo + 1
            }
            None => {
                range.parse::<usize>().map_err(|_| invalid())?;
                1
            }
        };
    }
    Ok(count)
}

impl HalDriver for HostTaskDriver {
    fn name(&self) -> &str {
        "local-task"
    }

    fn probe_devices(&self) -> Result<Vec<RawDeviceInfo>, HalError> {
        if !self.split_numa {
            return Ok(vec![Self::whole_host()]);
        }
        match self.numa_nodes() {
            Ok(nodes) if !nodes.is_empty() => Ok(nodes
                .into_iter()
                .map(|(node, cpus)| RawDeviceInfo {
                    identity: format!("host:node{}", node),
                    name: format!("Host CPU NUMA node {} ({} threads)", node, cpus),
                    index: node,
                    concurrency: cpus,
                    supports_plugins: true,
                })
                .collect()),
            Ok(_) => {
                warn!("No NUMA nodes with CPUs found, using a single host device");
                Ok(vec![Self::whole_host()])
            }
            Err(e) => {
                warn!("NUMA topology unavailable ({}), using a single host device", e);
                Ok(vec![Self::whole_host()])
            }
        }
    }

    fn open(&self, device: &RawDeviceInfo) -> Result<RawHandle, HalError> {
        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        lock(&self.open).insert(raw);
        debug!("Opened host device {} as handle {}", device.identity, raw);
        Ok(RawHandle(raw))
    }

    fn close(&self, handle: RawHandle) -> Result<(), HalError> {
        if lock(&self.open).remove(&handle.0) {
            Ok(())
        } else {
            Err(HalError::UnknownHandle(handle.0))
        }
    }
}

// =============================================================================
// Plugin loader
// =============================================================================

/// Checks for an ELF, Mach-O or PE header.
fn check_shared_object(bytes: &[u8]) -> Result<(), HalError> {
    const MACHO: [[u8; 4]; 5] = [
        [0xfe, 0xed, 0xfa, 0xce],
        [0xfe, 0xed, 0xfa, 0xcf],
        [0xce, 0xfa, 0xed, 0xfe],
        [0xcf, 0xfa, 0xed, 0xfe],
        [0xca, 0xfe, 0xba, 0xbe],
    ];
    if bytes.starts_with(b"\x7fELF") || bytes.starts_with(b"MZ") {
        return Ok(());
    }
    if bytes.len() >= 4 && MACHO.iter().any(|magic| bytes[..4] == magic[..]) {
        return Ok(());
    }
    Err(HalError::InvalidImage(
        "not a shared library (unrecognized header)".to_string(),
    ))
}

struct LoadedPlugin {
    // Unloaded before its backing temp file is removed
    library: Library,
    _image: Option<TempPath>,
    device: RawHandle,
}

/// Loads host plugins as shared libraries.
///
/// A plugin must export `localrt_plugin_abi_version` returning
/// [`PLUGIN_ABI_VERSION`]. In-memory images are written to a temporary
/// file that lives as long as the plugin stays loaded.
pub struct HostPluginLoader {
    next: AtomicU64,
    plugins: Mutex<HashMap<u64, LoadedPlugin>>,
}

impl Default for HostPluginLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPluginLoader {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            plugins: Mutex::new(HashMap::new()),
        }
    }

    /// Number of plugins currently loaded.
    pub fn loaded(&self) -> usize {
        lock(&self.plugins).len()
    }

    fn stage(bytes: &[u8]) -> Result<TempPath, HalError> {
        let mut file = tempfile::Builder::new()
            .prefix("localrt-plugin-")
            .suffix(std::env::consts::DLL_SUFFIX)
            .tempfile()?;
        file.write_all(bytes)?;
        file.flush()?;
        Ok(file.into_temp_path())
    }

    fn open_library(path: &Path) -> Result<Library, HalError> {
        // SAFETY: loading runs the library's initializers. Plugins are
        // trusted code supplied by the caller.
        let library = unsafe { Library::new(path) }
            .map_err(|e| HalError::InvalidImage(format!("failed to open plugin: {}", e)))?;

        // SAFETY: the ABI symbol is declared as `extern "C" fn() -> u32`.
        let version = unsafe {
            let abi = library
                .get::<unsafe extern "C" fn() -> u32>(PLUGIN_ABI_SYMBOL)
                .map_err(|e| {
                    HalError::InvalidImage(format!("missing plugin ABI symbol: {}", e))
                })?;
            abi()
        };
        if version != PLUGIN_ABI_VERSION {
            return Err(HalError::UnsupportedAbi {
                expected: PLUGIN_ABI_VERSION,
                found: version,
            });
        }
        Ok(library)
    }
}

impl PluginLoader for HostPluginLoader {
    fn load(&self, image: &ArtifactImage, device: RawHandle) -> Result<PluginToken, HalError> {
        let bytes = image.bytes()?;
        check_shared_object(&bytes)?;

        let (library, staged) = match image {
            ArtifactImage::File(path) => (Self::open_library(path)?, None),
            ArtifactImage::Bytes(_) => {
                let staged = Self::stage(&bytes)?;
                (Self::open_library(&staged)?, Some(staged))
            }
        };

        let token = self.next.fetch_add(1, Ordering::Relaxed);
        lock(&self.plugins).insert(
            token,
            LoadedPlugin {
                library,
                _image: staged,
                device,
            },
        );
        debug!("Host plugin {} loaded for device handle {}", token, device.0);
        Ok(PluginToken(token))
    }

    fn unload(&self, token: PluginToken) -> Result<(), HalError> {
        let plugin = lock(&self.plugins)
            .remove(&token.0)
            .ok_or(HalError::UnknownHandle(token.0))?;
        debug!(
            "Host plugin {} unloaded from device handle {}",
            token.0, plugin.device.0
        );
        plugin
            .library
            .close()
            .map_err(|e| HalError::Io(format!("failed to close plugin: {}", e)))
    }
}
