//! Shared fixtures for integration tests: a counting HAL driver, an
//! in-memory plugin loader, and a factory wired to them.

#![allow(dead_code)]

use localrt_core::adapter::{AmdGpuAdapter, HostCpuAdapter};
use localrt_core::hal::{HalDriver, PluginLoader, PluginToken, RawDeviceInfo, RawHandle};
use localrt_core::{
    ArtifactImage, BackendKind, DeviceDriverAdapter, HalError, SystemConfig, SystemFactory,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// ============================================================================
// Counting driver
// ============================================================================

/// Driver that reports a fixed device list and counts every open and close.
pub struct CountingDriver {
    devices: usize,
    available: AtomicBool,
    next: AtomicU64,
    live: Mutex<HashSet<u64>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    double_closes: AtomicUsize,
}

impl CountingDriver {
    pub fn new(devices: usize) -> Arc<Self> {
        Arc::new(Self {
            devices,
            available: AtomicBool::new(true),
            next: AtomicU64::new(100),
            live: Mutex::new(HashSet::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            double_closes: AtomicUsize::new(0),
        })
    }

    pub fn unavailable() -> Arc<Self> {
        let driver = Self::new(0);
        driver.available.store(false, Ordering::SeqCst);
        driver
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Close calls for handles that were not open.
    pub fn double_closes(&self) -> usize {
        self.double_closes.load(Ordering::SeqCst)
    }

    /// Handles currently open.
    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl HalDriver for CountingDriver {
    fn name(&self) -> &str {
        "counting"
    }

    fn probe_devices(&self) -> Result<Vec<RawDeviceInfo>, HalError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(HalError::Unavailable("driver not installed".to_string()));
        }
        Ok((0..self.devices as u32)
            .map(|index| RawDeviceInfo {
                identity: format!("counting:{}", index),
                name: format!("Counting Device {}", index),
                index,
                concurrency: 2,
                supports_plugins: true,
            })
            .collect())
    }

    fn open(&self, _device: &RawDeviceInfo) -> Result<RawHandle, HalError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let raw = self.next.fetch_add(1, Ordering::SeqCst);
        self.live.lock().unwrap().insert(raw);
        Ok(RawHandle(raw))
    }

    fn close(&self, handle: RawHandle) -> Result<(), HalError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.live.lock().unwrap().remove(&handle.0) {
            Ok(())
        } else {
            self.double_closes.fetch_add(1, Ordering::SeqCst);
            Err(HalError::UnknownHandle(handle.0))
        }
    }
}

// ============================================================================
// Plugin loader
// ============================================================================

/// Loader accepting images that start with `PLUGIN`.
#[derive(Default)]
pub struct MemoryLoader {
    next: AtomicU64,
    resident: Mutex<HashSet<u64>>,
}

impl MemoryLoader {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn resident(&self) -> usize {
        self.resident.lock().unwrap().len()
    }
}

impl PluginLoader for MemoryLoader {
    fn load(&self, image: &ArtifactImage, _device: RawHandle) -> Result<PluginToken, HalError> {
        if !image.bytes()?.starts_with(b"PLUGIN") {
            return Err(HalError::InvalidImage("missing PLUGIN header".to_string()));
        }
        let token = self.next.fetch_add(1, Ordering::SeqCst);
        self.resident.lock().unwrap().insert(token);
        Ok(PluginToken(token))
    }

    fn unload(&self, token: PluginToken) -> Result<(), HalError> {
        if self.resident.lock().unwrap().remove(&token.0) {
            Ok(())
        } else {
            Err(HalError::UnknownHandle(token.0))
        }
    }
}

// ============================================================================
// Factory wiring
// ============================================================================

pub struct Fixture {
    pub factory: SystemFactory,
    pub host: Arc<CountingDriver>,
    pub gpu: Arc<CountingDriver>,
    pub host_loader: Arc<MemoryLoader>,
    pub gpu_loader: Arc<MemoryLoader>,
}

/// Factory whose HostCpu and AmdGpu constructors use counting drivers.
pub fn fixture(host: Arc<CountingDriver>, gpu: Arc<CountingDriver>) -> Fixture {
    let host_loader = MemoryLoader::new();
    let gpu_loader = MemoryLoader::new();
    let mut factory = SystemFactory::new();

    {
        let driver = host.clone();
        let loader = host_loader.clone();
        factory.register(BackendKind::HostCpu, move |config: &SystemConfig| {
            Ok(Arc::new(HostCpuAdapter::with_driver(
                driver.clone(),
                loader.clone(),
                config.host.worker_threads,
            )) as Arc<dyn DeviceDriverAdapter>)
        });
    }
    {
        let driver = gpu.clone();
        let loader = gpu_loader.clone();
        factory.register(BackendKind::AmdGpu, move |config: &SystemConfig| {
            Ok(Arc::new(AmdGpuAdapter::with_driver(
                driver.clone(),
                loader.clone(),
                config.amdgpu.clone(),
            )) as Arc<dyn DeviceDriverAdapter>)
        });
    }

    Fixture {
        factory,
        host,
        gpu,
        host_loader,
        gpu_loader,
    }
}

/// Host plus AmdGpu enabled, one worker per host device.
pub fn mixed_config() -> SystemConfig {
    SystemConfig::default()
        .with_backend(BackendKind::AmdGpu)
        .with_worker_threads(1)
}
