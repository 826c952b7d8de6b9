//! Counting fakes for unit tests.

use crate::error::HalError;
use crate::executable::ArtifactImage;
use crate::hal::{HalDriver, PluginLoader, PluginToken, RawDeviceInfo, RawHandle};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

/// HAL driver reporting `count` devices and counting open/close calls.
pub struct FakeDriver {
    count: usize,
    supports_plugins: bool,
    fail_probe: AtomicBool,
    fail_close: AtomicBool,
    fail_open_index: Mutex<Option<u32>>,
    next: AtomicU64,
    open_handles: Mutex<HashSet<u64>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
    probes: AtomicUsize,
}

impl FakeDriver {
    pub fn new(count: usize) -> Self {
        Self {
            count,
            supports_plugins: true,
            fail_probe: AtomicBool::new(false),
            fail_close: AtomicBool::new(false),
            fail_open_index: Mutex::new(None),
            next: AtomicU64::new(1),
            open_handles: Mutex::new(HashSet::new()),
            opens: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn without_plugins(mut self) -> Self {
        self.supports_plugins = false;
        self
    }

    pub fn fail_probe(&self, fail: bool) {
        self.fail_probe.store(fail, Ordering::SeqCst);
    }

    pub fn fail_close(&self, fail: bool) {
        self.fail_close.store(fail, Ordering::SeqCst);
    }

    pub fn fail_open(&self, index: Option<u32>) {
        *self.fail_open_index.lock().unwrap() = index;
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Handles opened and not yet closed.
    pub fn live(&self) -> usize {
        self.open_handles.lock().unwrap().len()
    }
}

impl HalDriver for FakeDriver {
    fn name(&self) -> &str {
        "fake"
    }

    fn probe_devices(&self) -> Result<Vec<RawDeviceInfo>, HalError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.fail_probe.load(Ordering::SeqCst) {
            return Err(HalError::Unavailable("fake driver offline".to_string()));
        }
        Ok((0..self.count as u32)
            .map(|index| RawDeviceInfo {
                identity: format!("fake:{}", index),
                name: format!("Fake Device {}", index),
                index,
                concurrency: 2,
                supports_plugins: self.supports_plugins,
            })
            .collect())
    }

    fn open(&self, device: &RawDeviceInfo) -> Result<RawHandle, HalError> {
        if *self.fail_open_index.lock().unwrap() == Some(device.index) {
            return Err(HalError::Call {
                call: "fakeOpen",
                code: 2,
            });
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        let raw = self.next.fetch_add(1, Ordering::SeqCst);
        self.open_handles.lock().unwrap().insert(raw);
        Ok(RawHandle(raw))
    }

    fn close(&self, handle: RawHandle) -> Result<(), HalError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.open_handles.lock().unwrap().remove(&handle.0);
        if self.fail_close.load(Ordering::SeqCst) {
            return Err(HalError::Call {
                call: "fakeClose",
                code: 3,
            });
        }
        Ok(())
    }
}

/// Plugin loader that accepts any non-empty image.
#[derive(Default)]
pub struct FakeLoader {
    next: AtomicU64,
    resident: Mutex<HashSet<u64>>,
    loads: AtomicUsize,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn resident(&self) -> usize {
        self.resident.lock().unwrap().len()
    }
}

impl PluginLoader for FakeLoader {
    fn load(&self, image: &ArtifactImage, _device: RawHandle) -> Result<PluginToken, HalError> {
        if image.bytes()?.is_empty() {
            return Err(HalError::InvalidImage("empty image".to_string()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
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
