//! Opened device connections.

use super::types::{BackendKind, DeviceDescriptor, DeviceId};
use crate::error::HalError;
use crate::hal::{HalDriver, RawHandle};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A live connection to one device.
///
/// Cloning is cheap and yields another reference to the same connection.
/// Only the owning `System` (through its adapter) can close it; the raw
/// driver handle is released exactly once no matter how many clones exist
/// or how often close is requested.
#[derive(Clone)]
pub struct DeviceHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    descriptor: DeviceDescriptor,
    raw: RawHandle,
    driver: Arc<dyn HalDriver>,
    closed: AtomicBool,
}

impl DeviceHandle {
    pub(crate) fn new(
        descriptor: DeviceDescriptor,
        raw: RawHandle,
        driver: Arc<dyn HalDriver>,
    ) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                descriptor,
                raw,
                driver,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> DeviceId {
        self.inner.descriptor.id
    }

    pub fn kind(&self) -> BackendKind {
        self.inner.descriptor.id.kind
    }

    pub fn descriptor(&self) -> &DeviceDescriptor {
        &self.inner.descriptor
    }

    /// Driver-level handle, valid until the device is closed.
    pub fn raw(&self) -> RawHandle {
        self.inner.raw
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same connection.
    pub fn same_connection(&self, other: &DeviceHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Releases the raw handle.
    ///
    /// Returns `Ok(false)` if the handle was already closed. The driver is
    /// only ever asked once, even if that single call fails.
    pub(crate) fn close(&self) -> Result<bool, HalError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.inner.driver.close(self.inner.raw)?;
        Ok(true)
    }
}

impl fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id())
            .field("identity", &self.inner.descriptor.identity)
            .field("raw", &self.inner.raw)
            .field("closed", &self.is_closed())
            .finish()
    }
}
