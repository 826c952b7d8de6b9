//! Building systems from configuration.
//!
//! [`SystemFactory`] holds a lookup table of adapter constructors, one per
//! backend kind, and a table of [`BackendPolicy`]s. `build` walks the
//! enabled backends in priority order (host first), discovers devices,
//! opens the eager ones, and returns a `Ready` system or rolls everything
//! back.

#[cfg(feature = "amdgpu")]
use crate::adapter::AmdGpuAdapter;
use crate::adapter::{BackendPolicy, DeviceDriverAdapter, HostCpuAdapter, OpenPolicy};
use crate::config::{SchedulerMode, SystemConfig};
use crate::device::BackendKind;
use crate::error::SystemError;
use crate::scheduler::{self, SystemId, TaskScheduler};
use crate::system::System;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates the adapter for one backend from the system configuration.
pub type AdapterConstructor = Box<
    dyn Fn(&SystemConfig) -> Result<Arc<dyn DeviceDriverAdapter>, SystemError> + Send + Sync,
>;

/// Builds [`System`]s.
///
/// # Example
///
/// ```ignore
/// let factory = SystemFactory::with_compiled_backends();
/// let config = SystemConfig::default().with_backend(BackendKind::AmdGpu);
/// let system = factory.build(&config)?;
///
/// for device in system.devices(None)? {
///     println!("{}", device.id());
/// }
/// ```
pub struct SystemFactory {
    constructors: HashMap<BackendKind, AdapterConstructor>,
    policies: HashMap<BackendKind, BackendPolicy>,
}

impl Default for SystemFactory {
    fn default() -> Self {
        Self::with_compiled_backends()
    }
}

impl SystemFactory {
    /// Factory with no backends registered.
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
            policies: HashMap::new(),
        }
    }

    /// Factory with every backend compiled into this build.
    ///
    /// HostCpu is always present; AmdGpu requires the `amdgpu` feature.
    pub fn with_compiled_backends() -> Self {
        let mut factory = Self::new();
        factory.register(BackendKind::HostCpu, |config: &SystemConfig| {
            Ok(Arc::new(HostCpuAdapter::new(&config.host)) as Arc<dyn DeviceDriverAdapter>)
        });
        #[cfg(feature = "amdgpu")]
        factory.register(BackendKind::AmdGpu, |config: &SystemConfig| {
            Ok(Arc::new(AmdGpuAdapter::new(&config.amdgpu)) as Arc<dyn DeviceDriverAdapter>)
        });
        factory
    }

    /// Registers (or replaces) the constructor for a backend kind.
    pub fn register<F>(&mut self, kind: BackendKind, constructor: F) -> &mut Self
    where
        F: Fn(&SystemConfig) -> Result<Arc<dyn DeviceDriverAdapter>, SystemError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(kind, Box::new(constructor));
        self
    }

    /// Overrides the policy of one backend kind.
    pub fn set_policy(&mut self, policy: BackendPolicy) -> &mut Self {
        self.policies.insert(policy.kind, policy);
        self
    }

    pub fn policy(&self, kind: BackendKind) -> BackendPolicy {
        self.policies
            .get(&kind)
            .copied()
            .unwrap_or_else(|| BackendPolicy::default_for(kind))
    }

    /// Registered backend kinds in priority order.
    pub fn registered_backends(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.constructors.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Builds a system, choosing its scheduler from `config.scheduler`.
    ///
    /// The final "no usable backend" check counts discovered devices, not
    /// opened ones. Lazy devices are only opened on first use, so a
    /// configuration with no required backend (e.g. GPU only) can reach
    /// `Ready` and still find every device failed when it is first listed.
    pub fn build(&self, config: &SystemConfig) -> Result<System, SystemError> {
        config.validate()?;
        let id = SystemId::next();
        let scheduler = match config.scheduler {
            SchedulerMode::Dedicated => scheduler::dedicated(id),
            SchedulerMode::Global => scheduler::global(),
        };
        self.build_system(config, id, scheduler)
    }

    /// Builds a system that runs its work on `scheduler`.
    pub fn build_with_scheduler(
        &self,
        config: &SystemConfig,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<System, SystemError> {
        config.validate()?;
        self.build_system(config, SystemId::next(), scheduler)
    }

    fn build_system(
        &self,
        config: &SystemConfig,
        id: SystemId,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Result<System, SystemError> {
        let mut system = System::new(id, scheduler);
        system.begin_initialization();
        info!("Building {} ({:?})", id, config.probe_order());

        for kind in config.probe_order() {
            let policy = self.policy(kind);
            match self.add_backend(&mut system, config, policy) {
                Ok(()) => {}
                Err(e) if !policy.required => {
                    warn!("Skipping optional backend {}: {}", kind, e);
                    system.record_skipped(kind, e.to_string());
                }
                Err(e) => {
                    warn!("Required backend {} failed, rolling back: {}", kind, e);
                    system.shutdown();
                    return Err(SystemError::NoUsableBackend(format!(
                        "required backend {} failed: {}",
                        kind, e
                    )));
                }
            }
        }

        if system.device_count() == 0 {
            system.shutdown();
            return Err(SystemError::NoUsableBackend(
                "no devices discovered on any enabled backend".to_string(),
            ));
        }

        system.mark_ready();
        Ok(system)
    }

    /// Discovers one backend's devices into the system and opens eager ones.
    fn add_backend(
        &self,
        system: &mut System,
        config: &SystemConfig,
        policy: BackendPolicy,
    ) -> Result<(), SystemError> {
        let kind = policy.kind;
        let constructor =
            self.constructors
                .get(&kind)
                .ok_or_else(|| SystemError::BackendUnavailable {
                    kind,
                    reason: "backend not compiled into this build".to_string(),
                })?;
        let adapter = constructor(config)?;
        let descriptors = adapter.discover()?;
        if descriptors.is_empty() {
            return Err(SystemError::BackendUnavailable {
                kind,
                reason: "no devices found".to_string(),
            });
        }

        debug!("Discovered {} {} device(s)", descriptors.len(), kind);
        for descriptor in descriptors {
            system.add_device(descriptor, policy)?;
        }
        system.register_adapter(adapter);

        if policy.open == OpenPolicy::Eager && system.open_all(kind) == 0 {
            return Err(SystemError::BackendUnavailable {
                kind,
                reason: "no device could be opened".to_string(),
            });
        }
        Ok(())
    }
}
