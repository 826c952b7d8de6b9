//! HIP runtime binding for AMD GPUs.
//!
//! `libamdhip64` is bound at run time with `libloading`, so the crate builds
//! and runs on machines without ROCm: the driver only reports itself
//! unavailable. The library is loaded on first probe and kept for the
//! lifetime of the driver.

use super::{HalDriver, PluginLoader, PluginToken, RawDeviceInfo, RawHandle};
use crate::config::HIP_LIBRARY_NAMES;
use crate::error::HalError;
use crate::executable::ArtifactImage;
use libloading::Library;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

type HipResult = i32;
type HipStream = *mut c_void;
type HipModule = *mut c_void;

const HIP_SUCCESS: HipResult = 0;
const DEVICE_NAME_LEN: usize = 256;

type HipInitFn = unsafe extern "C" fn(flags: u32) -> HipResult;
type HipGetDeviceCountFn = unsafe extern "C" fn(count: *mut i32) -> HipResult;
type HipDeviceGetNameFn =
    unsafe extern "C" fn(name: *mut c_char, len: i32, device: i32) -> HipResult;
type HipSetDeviceFn = unsafe extern "C" fn(device: i32) -> HipResult;
type HipStreamCreateFn = unsafe extern "C" fn(stream: *mut HipStream) -> HipResult;
type HipStreamSynchronizeFn = unsafe extern "C" fn(stream: HipStream) -> HipResult;
type HipStreamDestroyFn = unsafe extern "C" fn(stream: HipStream) -> HipResult;
type HipModuleLoadDataFn =
    unsafe extern "C" fn(module: *mut HipModule, image: *const c_void) -> HipResult;
type HipModuleUnloadFn = unsafe extern "C" fn(module: HipModule) -> HipResult;

struct HipFns {
    hip_get_device_count: HipGetDeviceCountFn,
    hip_device_get_name: HipDeviceGetNameFn,
    hip_set_device: HipSetDeviceFn,
    hip_stream_create: HipStreamCreateFn,
    hip_stream_synchronize: HipStreamSynchronizeFn,
    hip_stream_destroy: HipStreamDestroyFn,
    hip_module_load_data: HipModuleLoadDataFn,
    hip_module_unload: HipModuleUnloadFn,
}

/// Loaded HIP runtime library and its entry points.
struct HipRuntime {
    _lib: Library,
    fns: HipFns,
}

impl HipRuntime {
    fn load(explicit: Option<&PathBuf>) -> Result<Self, HalError> {
        let lib = load_hip_library(explicit)?;
        let init: HipInitFn = load_symbol(&lib, b"hipInit\0")?;
        let fns = HipFns {
            hip_get_device_count: load_symbol(&lib, b"hipGetDeviceCount\0")?,
            hip_device_get_name: load_symbol(&lib, b"hipDeviceGetName\0")?,
            hip_set_device: load_symbol(&lib, b"hipSetDevice\0")?,
            hip_stream_create: load_symbol(&lib, b"hipStreamCreate\0")?,
            hip_stream_synchronize: load_symbol(&lib, b"hipStreamSynchronize\0")?,
            hip_stream_destroy: load_symbol(&lib, b"hipStreamDestroy\0")?,
            hip_module_load_data: load_symbol(&lib, b"hipModuleLoadData\0")?,
            hip_module_unload: load_symbol(&lib, b"hipModuleUnload\0")?,
        };

        // SAFETY: hipInit takes no pointers; flags must be 0.
        check_hip(unsafe { init(0) }, "hipInit")?;
        Ok(Self { _lib: lib, fns })
    }

    fn device_count(&self) -> Result<i32, HalError> {
        let mut count = 0i32;
        // SAFETY: count is a valid out pointer.
        check_hip(
            unsafe { (self.fns.hip_get_device_count)(&mut count) },
            "hipGetDeviceCount",
        )?;
        Ok(count)
    }

    fn device_name(&self, device: i32) -> Result<String, HalError> {
        let mut buf = [0 as c_char; DEVICE_NAME_LEN];
        // SAFETY: buf is writable for DEVICE_NAME_LEN bytes and the last
        // byte stays NUL, so CStr::from_ptr stays in bounds.
        unsafe {
            check_hip(
                (self.fns.hip_device_get_name)(buf.as_mut_ptr(), (DEVICE_NAME_LEN - 1) as i32, device),
                "hipDeviceGetName",
            )?;
            Ok(CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned())
        }
    }

    fn set_device(&self, device: i32) -> Result<(), HalError> {
        // SAFETY: device is an index reported by hipGetDeviceCount.
        check_hip(unsafe { (self.fns.hip_set_device)(device) }, "hipSetDevice")
    }
}

fn load_hip_library(explicit: Option<&PathBuf>) -> Result<Library, HalError> {
    if let Some(path) = explicit {
        // SAFETY: dynamic library probe only; no symbols are invoked here.
        return unsafe { Library::new(path) }.map_err(|e| {
            HalError::Unavailable(format!("failed to load {}: {}", path.display(), e))
        });
    }
    for candidate in HIP_LIBRARY_NAMES {
        // SAFETY: dynamic library probe only; no symbols are invoked here.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            debug!("Loaded HIP runtime from {}", candidate);
            return Ok(lib);
        }
    }
    Err(HalError::Unavailable(format!(
        "HIP runtime not found (tried {})",
        HIP_LIBRARY_NAMES.join(", ")
    )))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> Result<T, HalError> {
    // SAFETY: callers pass the HIP runtime signature for the symbol.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|e| {
        HalError::Unavailable(format!(
            "failed to resolve HIP symbol {}: {}",
            String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]),
            e
        ))
    })?;
    Ok(*sym)
}

fn check_hip(code: HipResult, call: &'static str) -> Result<(), HalError> {
    if code == HIP_SUCCESS {
        Ok(())
    } else {
        Err(HalError::Call { call, code })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An opened GPU: its HIP ordinal plus one command stream.
#[derive(Clone, Copy)]
struct OpenDevice {
    device: i32,
    // Stored as usize so the driver stays Send + Sync
    stream: usize,
}

/// HIP-based GPU driver.
///
/// Each opened device owns one HIP stream, which serves as the device's
/// command queue. Closing synchronizes and destroys the stream.
pub struct HipDriver {
    library: Option<PathBuf>,
    runtime: OnceCell<Result<Arc<HipRuntime>, HalError>>,
    next: AtomicU64,
    open: Mutex<HashMap<u64, OpenDevice>>,
}

impl HipDriver {
    /// Creates a driver that loads `library`, or the default library names.
    pub fn new(library: Option<PathBuf>) -> Self {
        Self {
            library,
            runtime: OnceCell::new(),
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    fn runtime(&self) -> Result<Arc<HipRuntime>, HalError> {
        self.runtime
            .get_or_init(|| {
                HipRuntime::load(self.library.as_ref()).map(|rt| {
                    info!("HIP runtime initialized");
                    Arc::new(rt)
                })
            })
            .clone()
    }

    fn open_device(&self, handle: RawHandle) -> Result<OpenDevice, HalError> {
        lock(&self.open)
            .get(&handle.0)
            .copied()
            .ok_or(HalError::UnknownHandle(handle.0))
    }

    fn release(runtime: &HipRuntime, open: OpenDevice) -> Result<(), HalError> {
        let stream = open.stream as HipStream;
        runtime.set_device(open.device)?;
        // SAFETY: stream was created by hipStreamCreate on this device and
        // is destroyed exactly once, here.
        unsafe {
            let synced = check_hip(
                (runtime.fns.hip_stream_synchronize)(stream),
                "hipStreamSynchronize",
            );
            check_hip((runtime.fns.hip_stream_destroy)(stream), "hipStreamDestroy")?;
            synced
        }
    }
}

impl HalDriver for HipDriver {
    fn name(&self) -> &str {
        "hip"
    }

    fn probe_devices(&self) -> Result<Vec<RawDeviceInfo>, HalError> {
        let runtime = self.runtime()?;
        let count = runtime.device_count()?;
        if count <= 0 {
            return Err(HalError::Unavailable("no HIP devices present".to_string()));
        }

        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let name = runtime.device_name(index).unwrap_or_else(|e| {
                warn!("Could not read name of HIP device {}: {}", index, e);
                format!("AMD GPU {}", index)
            });
            devices.push(RawDeviceInfo {
                identity: format!("hip:{}", index),
                name,
                index: index as u32,
                concurrency: 1,
                supports_plugins: true,
            });
        }
        Ok(devices)
    }

    fn open(&self, device: &RawDeviceInfo) -> Result<RawHandle, HalError> {
        let runtime = self.runtime()?;
        let ordinal = device.index as i32;
        runtime.set_device(ordinal)?;

        let mut stream: HipStream = std::ptr::null_mut();
        // SAFETY: stream is a valid out pointer.
        check_hip(
            unsafe { (runtime.fns.hip_stream_create)(&mut stream) },
            "hipStreamCreate",
        )?;

        let raw = self.next.fetch_add(1, Ordering::Relaxed);
        lock(&self.open).insert(
            raw,
            OpenDevice {
                device: ordinal,
                stream: stream as usize,
            },
        );
        debug!("Opened {} with stream {:#x}", device.identity, stream as usize);
        Ok(RawHandle(raw))
    }

    fn close(&self, handle: RawHandle) -> Result<(), HalError> {
        let open = lock(&self.open)
            .remove(&handle.0)
            .ok_or(HalError::UnknownHandle(handle.0))?;
        let runtime = self.runtime()?;
        Self::release(&runtime, open)
    }
}

impl Drop for HipDriver {
    fn drop(&mut self) {
        let leaked: Vec<OpenDevice> = lock(&self.open).drain().map(|(_, d)| d).collect();
        if leaked.is_empty() {
            return;
        }
        if let Some(Ok(runtime)) = self.runtime.get() {
            warn!("Releasing {} HIP streams left open", leaked.len());
            for open in leaked {
                let _ = Self::release(runtime, open);
            }
        }
    }
}

// =============================================================================
// Module loader
// =============================================================================

/// Loads AMDGPU code objects with `hipModuleLoadData`.
pub struct HipModuleLoader {
    driver: Arc<HipDriver>,
    next: AtomicU64,
    // Module pointers stored as usize, keyed by token
    modules: Mutex<HashMap<u64, (i32, usize)>>,
}

impl HipModuleLoader {
    pub fn new(driver: Arc<HipDriver>) -> Self {
        Self {
            driver,
            next: AtomicU64::new(1),
            modules: Mutex::new(HashMap::new()),
        }
    }
}

impl PluginLoader for HipModuleLoader {
    fn load(&self, image: &ArtifactImage, device: RawHandle) -> Result<PluginToken, HalError> {
        let bytes = image.bytes()?;
        if !bytes.starts_with(b"\x7fELF") {
            return Err(HalError::InvalidImage(
                "expected an AMDGPU ELF code object".to_string(),
            ));
        }
        let open = self.driver.open_device(device)?;
        let runtime = self.driver.runtime()?;
        runtime.set_device(open.device)?;

        let mut module: HipModule = std::ptr::null_mut();
        // SAFETY: module is a valid out pointer and bytes outlives the call;
        // HIP copies the image during load.
        check_hip(
            unsafe { (runtime.fns.hip_module_load_data)(&mut module, bytes.as_ptr().cast()) },
            "hipModuleLoadData",
        )?;

        let token = self.next.fetch_add(1, Ordering::Relaxed);
        lock(&self.modules).insert(token, (open.device, module as usize));
        Ok(PluginToken(token))
    }

    fn unload(&self, token: PluginToken) -> Result<(), HalError> {
        let (device, module) = lock(&self.modules)
            .remove(&token.0)
            .ok_or(HalError::UnknownHandle(token.0))?;
        let runtime = self.driver.runtime()?;
        runtime.set_device(device)?;
        // SAFETY: module came from hipModuleLoadData and is unloaded once.
        check_hip(
            unsafe { (runtime.fns.hip_module_unload)(module as HipModule) },
            "hipModuleUnload",
        )
    }
}
