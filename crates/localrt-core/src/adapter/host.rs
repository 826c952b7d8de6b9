//! Host CPU adapter.

use super::{DeviceDriverAdapter, DriverBinding};
use crate::config::HostCpuConfig;
use crate::device::{BackendKind, DeviceDescriptor, DeviceHandle};
use crate::error::SystemError;
use crate::hal::host::{HostPluginLoader, HostTaskDriver};
use crate::hal::{HalDriver, PluginLoader};
use std::sync::Arc;

/// Adapter for the task-based host CPU driver.
///
/// `worker_threads`, when set, overrides the concurrency of every host
/// device; otherwise each device runs one worker per logical CPU.
pub struct HostCpuAdapter {
    binding: DriverBinding,
    loader: Arc<dyn PluginLoader>,
    worker_threads: Option<usize>,
}

impl HostCpuAdapter {
    pub fn new(config: &HostCpuConfig) -> Self {
        Self::with_driver(
            Arc::new(HostTaskDriver::new(config.split_numa)),
            Arc::new(HostPluginLoader::new()),
            config.worker_threads,
        )
    }

    /// Builds the adapter over an arbitrary driver and loader.
    pub fn with_driver(
        driver: Arc<dyn HalDriver>,
        loader: Arc<dyn PluginLoader>,
        worker_threads: Option<usize>,
    ) -> Self {
        Self {
            binding: DriverBinding::new(BackendKind::HostCpu, driver),
            loader,
            worker_threads,
        }
    }
}

impl DeviceDriverAdapter for HostCpuAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::HostCpu
    }

    fn discover(&self) -> Result<Vec<DeviceDescriptor>, SystemError> {
        let infos = self.binding.probe()?;
        let threads = self.worker_threads;
        Ok(self
            .binding
            .describe(infos, |info| threads.unwrap_or(info.concurrency)))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceId;
    use crate::test_utils::{FakeDriver, FakeLoader};

    fn adapter(driver: &Arc<FakeDriver>, threads: Option<usize>) -> HostCpuAdapter {
        HostCpuAdapter::with_driver(driver.clone(), Arc::new(FakeLoader::new()), threads)
    }

    #[test]
    fn test_ordinals_contiguous_and_stable() {
        let driver = Arc::new(FakeDriver::new(3));
        let adapter = adapter(&driver, None);

        let first = adapter.discover().unwrap();
        let second = adapter.discover().unwrap();
        let ids: Vec<DeviceId> = first.iter().map(|d| d.id).collect();
        assert_eq!(
            ids,
            (0..3)
                .map(|i| DeviceId::new(BackendKind::HostCpu, i))
                .collect::<Vec<_>>()
        );
        assert_eq!(first, second);
        assert_eq!(first[0].capabilities.concurrency, 2);
    }

    #[test]
    fn test_worker_threads_override() {
        let driver = Arc::new(FakeDriver::new(1));
        let adapter = adapter(&driver, Some(6));
        let devices = adapter.discover().unwrap();
        assert_eq!(devices[0].capabilities.concurrency, 6);
    }

    #[test]
    fn test_probe_failure_is_backend_unavailable() {
        let driver = Arc::new(FakeDriver::new(1));
        driver.fail_probe(true);
        let adapter = adapter(&driver, None);
        assert!(matches!(
            adapter.discover(),
            Err(SystemError::BackendUnavailable {
                kind: BackendKind::HostCpu,
                ..
            })
        ));
    }

    #[test]
    fn test_open_and_idempotent_close() {
        let driver = Arc::new(FakeDriver::new(2));
        let adapter = adapter(&driver, None);
        let devices = adapter.discover().unwrap();

        let handle = adapter.open(&devices[1]).unwrap();
        assert_eq!(handle.id(), devices[1].id);
        assert_eq!(driver.live(), 1);

        adapter.close(&handle);
        adapter.close(&handle);
        assert!(handle.is_closed());
        assert_eq!(driver.closes(), 1);
        assert_eq!(driver.live(), 0);
    }

    #[test]
    fn test_open_failure_is_device_open() {
        let driver = Arc::new(FakeDriver::new(2));
        driver.fail_open(Some(0));
        let adapter = adapter(&driver, None);
        let devices = adapter.discover().unwrap();

        assert!(matches!(
            adapter.open(&devices[0]),
            Err(SystemError::DeviceOpen { .. })
        ));
        assert!(adapter.open(&devices[1]).is_ok());
    }

    #[test]
    fn test_open_undiscovered_device() {
        let driver = Arc::new(FakeDriver::new(1));
        let adapter = adapter(&driver, None);
        let mut descriptor = adapter.discover().unwrap().remove(0);
        descriptor.id.ordinal = 5;
        assert!(matches!(
            adapter.open(&descriptor),
            Err(SystemError::DeviceOpen { .. })
        ));
        assert_eq!(driver.opens(), 0);
    }
}
