//! The system: devices of mixed kinds plus the scheduler that runs work on
//! them.
//!
//! A [`System`] is built by `SystemFactory` and owns every handle it
//! opens. Teardown is scoped: [`System::shutdown`] (also run on drop)
//! unloads all artifacts, drains and detaches each device's execution
//! context, closes every handle, and only then drops the scheduler.
//!
//! # State machine
//!
//! ```text
//! Uninitialized ──▶ Initializing ──▶ Ready ──▶ ShuttingDown ──▶ Closed
//!                         │                          ▲
//!                         └──────── (rollback) ──────┘
//! ```
//!
//! Queries, submission and loading require `Ready`.

use crate::adapter::{BackendPolicy, DeviceDriverAdapter};
use crate::device::{BackendKind, DeviceCapabilities, DeviceDescriptor, DeviceHandle, DeviceId};
use crate::error::SystemError;
use crate::executable::{ArtifactId, ExecutableArtifact, ExecutableLoadingService, LoadedRef};
use crate::scheduler::{
    Completion, ContextKey, ExecutionContext, SchedulerStats, SystemId, TaskScheduler, WorkContext,
};
use once_cell::sync::OnceCell;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lifecycle state of a [`System`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
    Closed,
}

impl fmt::Display for SystemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SystemState::Uninitialized => "uninitialized",
            SystemState::Initializing => "initializing",
            SystemState::Ready => "ready",
            SystemState::ShuttingDown => "shutting down",
            SystemState::Closed => "closed",
        })
    }
}

/// A backend left out of the system, with the reason.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedBackend {
    pub kind: BackendKind,
    pub reason: String,
}

/// Open status of one device.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    /// Not opened yet (lazy backend)
    Pending,
    Open,
    /// Open attempt failed; the device is left out
    Failed,
    Closed,
}

/// One device in a [`SystemReport`].
#[derive(Clone, Debug, Serialize)]
pub struct DeviceReport {
    pub id: DeviceId,
    pub identity: String,
    pub name: String,
    pub capabilities: DeviceCapabilities,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Snapshot of a system for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct SystemReport {
    pub system: SystemId,
    pub state: SystemState,
    pub devices: Vec<DeviceReport>,
    pub skipped: Vec<SkippedBackend>,
    pub resident_artifacts: usize,
    pub scheduler: Option<SchedulerStats>,
}

struct DeviceSlot {
    descriptor: DeviceDescriptor,
    policy: BackendPolicy,
    /// Set once: the opened handle, or the reason opening failed
    handle: OnceCell<Result<DeviceHandle, SystemError>>,
}

impl DeviceSlot {
    fn opened(&self) -> Option<&DeviceHandle> {
        self.handle.get().and_then(|result| result.as_ref().ok())
    }
}

/// Aggregate of opened devices and the scheduler serving them.
pub struct System {
    id: SystemId,
    state: SystemState,
    slots: Vec<DeviceSlot>,
    index: HashMap<DeviceId, usize>,
    adapters: HashMap<BackendKind, Arc<dyn DeviceDriverAdapter>>,
    loading: ExecutableLoadingService,
    scheduler: Option<Arc<dyn TaskScheduler>>,
    skipped: Vec<SkippedBackend>,
}

impl System {
    pub(crate) fn new(id: SystemId, scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            id,
            state: SystemState::Uninitialized,
            slots: Vec::new(),
            index: HashMap::new(),
            adapters: HashMap::new(),
            loading: ExecutableLoadingService::new(),
            scheduler: Some(scheduler),
            skipped: Vec::new(),
        }
    }

    pub fn id(&self) -> SystemId {
        self.id
    }

    pub fn state(&self) -> SystemState {
        self.state
    }

    // =========================================================================
    // Construction (driven by SystemFactory)
    // =========================================================================

    pub(crate) fn begin_initialization(&mut self) {
        debug_assert_eq!(self.state, SystemState::Uninitialized);
        self.state = SystemState::Initializing;
    }

    pub(crate) fn register_adapter(&mut self, adapter: Arc<dyn DeviceDriverAdapter>) {
        self.loading
            .register_loader(adapter.kind(), adapter.plugin_loader());
        self.adapters.insert(adapter.kind(), adapter);
    }

    pub(crate) fn add_device(
        &mut self,
        descriptor: DeviceDescriptor,
        policy: BackendPolicy,
    ) -> Result<(), SystemError> {
        if self.index.contains_key(&descriptor.id) {
            return Err(SystemError::DuplicateDevice(descriptor.id));
        }
        self.index.insert(descriptor.id, self.slots.len());
        self.slots.push(DeviceSlot {
            descriptor,
            policy,
            handle: OnceCell::new(),
        });
        Ok(())
    }

    /// Opens every device of `kind`. Returns how many are open.
    pub(crate) fn open_all(&self, kind: BackendKind) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.descriptor.kind() == kind)
            .filter(|slot| self.ensure_open(slot).is_ok())
            .count()
    }

    pub(crate) fn record_skipped(&mut self, kind: BackendKind, reason: String) {
        self.skipped.push(SkippedBackend { kind, reason });
    }

    pub(crate) fn device_count(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = SystemState::Ready;
        info!(
            "{} ready with {} device(s), {} backend(s) skipped",
            self.id,
            self.slots.len(),
            self.skipped.len()
        );
    }

    // =========================================================================
    // Device access
    // =========================================================================

    fn require_ready(&self, operation: &'static str) -> Result<(), SystemError> {
        if self.state == SystemState::Ready {
            Ok(())
        } else {
            Err(SystemError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn context_key(&self, device: DeviceId) -> ContextKey {
        ContextKey::new(self.id, device)
    }

    /// Opens a slot on first use and attaches its execution context.
    ///
    /// The outcome is remembered: a failed open is not retried.
    fn ensure_open<'a>(&self, slot: &'a DeviceSlot) -> Result<&'a DeviceHandle, SystemError> {
        let result = slot.handle.get_or_init(|| {
            self.open_slot(slot).map_err(|e| {
                warn!("Device {} unavailable: {}", slot.descriptor.id, e);
                e
            })
        });
        result.as_ref().map_err(Clone::clone)
    }

    fn open_slot(&self, slot: &DeviceSlot) -> Result<DeviceHandle, SystemError> {
        let descriptor = &slot.descriptor;
        let adapter = self
            .adapters
            .get(&descriptor.kind())
            .ok_or(SystemError::UnknownDevice(descriptor.id))?;
        let scheduler = self.scheduler.as_ref().ok_or(SystemError::InvalidState {
            operation: "open device",
            state: self.state,
        })?;

        let handle = adapter.open(descriptor)?;
        let context = ExecutionContext {
            key: self.context_key(descriptor.id),
            width: descriptor.capabilities.concurrency,
        };
        if let Err(e) = scheduler.attach(context) {
            adapter.close(&handle);
            return Err(e.into());
        }
        info!(
            "Opened {} ({}, {:?} open)",
            descriptor.id, descriptor.name, slot.policy.open
        );
        Ok(handle)
    }

    fn slot(&self, id: &DeviceId) -> Result<&DeviceSlot, SystemError> {
        self.index
            .get(id)
            .map(|&i| &self.slots[i])
            .ok_or(SystemError::UnknownDevice(*id))
    }

    /// Open devices, optionally of one kind, in discovery order.
    ///
    /// Pending lazy devices of the requested kind are opened first. Devices
    /// that failed to open are left out.
    pub fn devices(&self, kind: Option<BackendKind>) -> Result<Vec<DeviceHandle>, SystemError> {
        self.require_ready("list devices")?;
        Ok(self
            .slots
            .iter()
            .filter(|slot| kind.map_or(true, |k| slot.descriptor.kind() == k))
            .filter_map(|slot| self.ensure_open(slot).ok().cloned())
            .collect())
    }

    /// Looks up one device, opening it if it is pending.
    pub fn device(&self, id: &DeviceId) -> Result<DeviceHandle, SystemError> {
        self.require_ready("look up device")?;
        let slot = self.slot(id)?;
        self.ensure_open(slot).cloned()
    }

    /// Descriptors of every discovered device, opened or not.
    pub fn descriptors(&self) -> impl Iterator<Item = &DeviceDescriptor> {
        self.slots.iter().map(|slot| &slot.descriptor)
    }

    /// Queues work on a device's execution context.
    ///
    /// Returns once the work is accepted; the `Completion` resolves when it
    /// has run.
    pub fn submit<F>(&self, device: &DeviceId, work: F) -> Result<Completion, SystemError>
    where
        F: FnOnce(&WorkContext) + Send + 'static,
    {
        self.require_ready("submit")?;
        let slot = self.slot(device)?;
        self.ensure_open(slot)?;
        let scheduler = self.scheduler.as_ref().ok_or(SystemError::InvalidState {
            operation: "submit",
            state: self.state,
        })?;
        Ok(scheduler.submit(self.context_key(*device), Box::new(work))?)
    }

    // =========================================================================
    // Executables
    // =========================================================================

    /// Loads an artifact onto a device, evicting any earlier residency of
    /// the same identity.
    pub fn load(
        &mut self,
        artifact: &ExecutableArtifact,
        device: &DeviceId,
    ) -> Result<LoadedRef, SystemError> {
        self.require_ready("load")?;
        let handle = self.device(device)?;
        self.loading.load(artifact, &handle)
    }

    /// Unloads a residency. Unloading twice or unloading a stale reference
    /// is not an error.
    pub fn unload(&mut self, loaded: &LoadedRef) -> Result<(), SystemError> {
        self.require_ready("unload")?;
        self.loading.unload(loaded);
        Ok(())
    }

    pub fn residency_count(&self) -> usize {
        self.loading.residency_count()
    }

    pub fn resident_device(&self, id: &ArtifactId) -> Option<DeviceId> {
        self.loading.resident_device(id)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Optional backends that were left out during build.
    pub fn skipped_backends(&self) -> &[SkippedBackend] {
        &self.skipped
    }

    pub fn scheduler_stats(&self) -> Option<SchedulerStats> {
        self.scheduler.as_ref().map(|s| s.stats())
    }

    /// Snapshot of devices, skipped backends and scheduler load.
    ///
    /// Does not open pending devices.
    pub fn report(&self) -> SystemReport {
        let devices = self
            .slots
            .iter()
            .map(|slot| {
                let (status, error) = match slot.handle.get() {
                    None => (DeviceStatus::Pending, None),
                    Some(Ok(handle)) if handle.is_closed() => (DeviceStatus::Closed, None),
                    Some(Ok(_)) => (DeviceStatus::Open, None),
                    Some(Err(e)) => (DeviceStatus::Failed, Some(e.to_string())),
                };
                DeviceReport {
                    id: slot.descriptor.id,
                    identity: slot.descriptor.identity.clone(),
                    name: slot.descriptor.name.clone(),
                    capabilities: slot.descriptor.capabilities,
                    status,
                    error,
                }
            })
            .collect();

        SystemReport {
            system: self.id,
            state: self.state,
            devices,
            skipped: self.skipped.clone(),
            resident_artifacts: self.loading.residency_count(),
            scheduler: self.scheduler_stats(),
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// Releases everything the system owns. Idempotent.
    ///
    /// Order: unload artifacts, drain and detach execution contexts, close
    /// handles, drop the scheduler reference. Errors along the way are
    /// logged and do not stop the teardown.
    pub fn shutdown(&mut self) {
        if matches!(self.state, SystemState::ShuttingDown | SystemState::Closed) {
            return;
        }
        info!("Shutting down {} (was {})", self.id, self.state);
        self.state = SystemState::ShuttingDown;

        let unloaded = self.loading.unload_all();
        if unloaded > 0 {
            debug!("Unloaded {} artifact(s)", unloaded);
        }

        if let Some(scheduler) = &self.scheduler {
            for handle in self.slots.iter().filter_map(DeviceSlot::opened) {
                let key = ContextKey::new(self.id, handle.id());
                match scheduler.drain(key) {
                    Ok(0) => {}
                    Ok(n) => debug!("Cancelled {} queued item(s) on {}", n, handle.id()),
                    Err(e) => warn!("Failed to drain {}: {}", key, e),
                }
                if let Err(e) = scheduler.detach(key) {
                    warn!("Failed to detach {}: {}", key, e);
                }
            }
        }

        for handle in self.slots.iter().filter_map(DeviceSlot::opened) {
            match self.adapters.get(&handle.kind()) {
                Some(adapter) => adapter.close(handle),
                None => warn!("No adapter to close {}", handle.id()),
            }
        }

        self.scheduler = None;
        self.adapters.clear();
        self.state = SystemState::Closed;
        info!("{} closed", self.id);
    }
}

impl Drop for System {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for System {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("System")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("devices", &self.slots.len())
            .field("skipped", &self.skipped)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{HostCpuAdapter, OpenPolicy};
    use crate::scheduler::{SchedulerError, WorkerPoolScheduler};
    use crate::test_utils::{FakeDriver, FakeLoader};
    use std::sync::mpsc;

    fn host_system(driver: &Arc<FakeDriver>, policy: BackendPolicy) -> System {
        let scheduler = Arc::new(WorkerPoolScheduler::new("test"));
        let mut system = System::new(SystemId::next(), scheduler);
        system.begin_initialization();
        let adapter = Arc::new(HostCpuAdapter::with_driver(
            driver.clone(),
            Arc::new(FakeLoader::new()),
            Some(1),
        ));
        for descriptor in adapter.discover().unwrap() {
            system.add_device(descriptor, policy).unwrap();
        }
        system.register_adapter(adapter);
        if policy.open == OpenPolicy::Eager {
            system.open_all(BackendKind::HostCpu);
        }
        system.mark_ready();
        system
    }

    fn eager() -> BackendPolicy {
        BackendPolicy::default_for(BackendKind::HostCpu)
    }

    fn lazy() -> BackendPolicy {
        BackendPolicy {
            open: OpenPolicy::Lazy,
            ..eager()
        }
    }

    fn host(ordinal: u32) -> DeviceId {
        DeviceId::new(BackendKind::HostCpu, ordinal)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SystemState::ShuttingDown.to_string(), "shutting down");
        assert_eq!(SystemState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_operations_require_ready() {
        let scheduler = Arc::new(WorkerPoolScheduler::new("test"));
        let system = System::new(SystemId::next(), scheduler);
        assert!(matches!(
            system.submit(&host(0), |_| {}),
            Err(SystemError::InvalidState {
                state: SystemState::Uninitialized,
                ..
            })
        ));
        assert!(matches!(
            system.devices(None),
            Err(SystemError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_duplicate_device_rejected() {
        let driver = Arc::new(FakeDriver::new(1));
        let mut system = host_system(&driver, eager());
        let descriptor = system.descriptors().next().unwrap().clone();
        assert!(matches!(
            system.add_device(descriptor, eager()),
            Err(SystemError::DuplicateDevice(_))
        ));
    }

    #[test]
    fn test_eager_devices_open_during_build() {
        let driver = Arc::new(FakeDriver::new(2));
        let system = host_system(&driver, eager());
        assert_eq!(driver.opens(), 2);

        let devices = system.devices(Some(BackendKind::HostCpu)).unwrap();
        let ids: Vec<DeviceId> = devices.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec![host(0), host(1)]);
        assert!(system.devices(Some(BackendKind::AmdGpu)).unwrap().is_empty());
    }

    #[test]
    fn test_lazy_devices_open_on_first_use() {
        let driver = Arc::new(FakeDriver::new(2));
        let system = host_system(&driver, lazy());
        assert_eq!(driver.opens(), 0);
        assert_eq!(system.report().devices[0].status, DeviceStatus::Pending);

        system.device(&host(1)).unwrap();
        assert_eq!(driver.opens(), 1);

        system.devices(None).unwrap();
        system.devices(None).unwrap();
        assert_eq!(driver.opens(), 2);
    }

    #[test]
    fn test_failed_lazy_open_is_sticky() {
        let driver = Arc::new(FakeDriver::new(2));
        driver.fail_open(Some(0));
        let system = host_system(&driver, lazy());

        let devices = system.devices(None).unwrap();
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].id(), host(1));

        driver.fail_open(None);
        assert!(matches!(
            system.device(&host(0)),
            Err(SystemError::DeviceOpen { .. })
        ));
        let report = system.report();
        assert_eq!(report.devices[0].status, DeviceStatus::Failed);
        assert!(report.devices[0].error.is_some());
    }

    #[test]
    fn test_submit_runs_on_device() {
        let driver = Arc::new(FakeDriver::new(1));
        let system = host_system(&driver, eager());
        let (tx, rx) = mpsc::channel();

        let completion = system
            .submit(&host(0), move |ctx: &WorkContext| {
                tx.send(ctx.device).unwrap();
            })
            .unwrap();
        assert_eq!(completion.wait(), Ok(()));
        assert_eq!(rx.recv().unwrap(), host(0));

        assert!(matches!(
            system.submit(&host(9), |_| {}),
            Err(SystemError::UnknownDevice(_))
        ));
    }

    #[test]
    fn test_shutdown_is_idempotent_and_closes_once() {
        let driver = Arc::new(FakeDriver::new(2));
        let mut system = host_system(&driver, eager());

        system.shutdown();
        system.shutdown();
        assert_eq!(system.state(), SystemState::Closed);
        assert_eq!(driver.closes(), 2);
        assert_eq!(driver.live(), 0);
        assert!(system.scheduler_stats().is_none());

        drop(system);
        assert_eq!(driver.closes(), 2);
    }

    #[test]
    fn test_submit_after_shutdown() {
        let driver = Arc::new(FakeDriver::new(1));
        let mut system = host_system(&driver, eager());
        system.shutdown();
        assert!(matches!(
            system.submit(&host(0), |_| {}),
            Err(SystemError::InvalidState {
                state: SystemState::Closed,
                ..
            })
        ));
    }

    #[test]
    fn test_shutdown_cancels_queued_work() {
        let driver = Arc::new(FakeDriver::new(1));
        let mut system = host_system(&driver, eager());
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let running = system
            .submit(&host(0), move |_| {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            })
            .unwrap();
        started_rx.recv().unwrap();
        let queued = system.submit(&host(0), |_| {}).unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            release_tx.send(()).unwrap();
        });
        system.shutdown();
        releaser.join().unwrap();

        assert_eq!(running.wait(), Ok(()));
        assert_eq!(queued.wait(), Err(SchedulerError::Cancelled));
        assert_eq!(driver.closes(), 1);
    }

    #[test]
    fn test_load_requires_matching_backend() {
        let driver = Arc::new(FakeDriver::new(1));
        let mut system = host_system(&driver, eager());

        let artifact = ExecutableArtifact::from_bytes("k", BackendKind::AmdGpu, vec![1]);
        assert!(matches!(
            system.load(&artifact, &host(0)),
            Err(SystemError::BackendMismatch { .. })
        ));

        let artifact = ExecutableArtifact::from_bytes("k", BackendKind::HostCpu, vec![1]);
        let loaded = system.load(&artifact, &host(0)).unwrap();
        assert_eq!(system.residency_count(), 1);
        system.unload(&loaded).unwrap();
        system.unload(&loaded).unwrap();
        assert_eq!(system.residency_count(), 0);
    }

    #[test]
    fn test_load_onto_device_without_plugins() {
        let driver = Arc::new(FakeDriver::new(1).without_plugins());
        let mut system = host_system(&driver, eager());
        let device = system.device(&host(0)).unwrap();
        assert!(!device.descriptor().capabilities.supports_plugins);

        let artifact = ExecutableArtifact::from_bytes("k", BackendKind::HostCpu, vec![1]);
        assert!(matches!(
            system.load(&artifact, &host(0)),
            Err(SystemError::LoadFailure { .. })
        ));
        assert_eq!(system.residency_count(), 0);
        // the device itself still runs work
        system.submit(&host(0), |_| {}).unwrap().wait().unwrap();
    }
}
