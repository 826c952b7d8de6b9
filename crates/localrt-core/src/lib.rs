//! # localrt Core
//!
//! System manager for a local-execution runtime: discovers host CPU and AMD
//! GPU devices, owns their handles, loads executable plugins onto them, and
//! routes work to a task scheduler.
//!
//! ## Modules
//!
//! - [`factory`] - Builds a `Ready` system from configuration
//! - [`system`] - Device aggregate, submission, residency and teardown
//! - [`adapter`] - Per-backend discovery and handle lifetime
//! - [`executable`] - Artifacts and the plugin loading service
//! - [`scheduler`] - Task scheduler trait and worker-pool implementation
//! - [`hal`] - Driver and plugin-loader interfaces, host and HIP bindings
//! - [`device`] - Backend kinds, device ids, descriptors and handles
//! - [`config`] - System configuration and constants
//! - [`error`] - Error types
//!
//! ## Example
//!
//! ```no_run
//! use localrt_core::{BackendKind, SystemConfig, SystemFactory};
//!
//! let config = SystemConfig::default().with_backend(BackendKind::AmdGpu);
//! let mut system = SystemFactory::with_compiled_backends().build(&config)?;
//!
//! let host = system.devices(Some(BackendKind::HostCpu))?[0].id();
//! system.submit(&host, |ctx| println!("running on {}", ctx.device))?.wait()?;
//!
//! system.shutdown();
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod adapter;
pub mod config;
pub mod device;
pub mod error;
pub mod executable;
pub mod factory;
pub mod hal;
pub mod scheduler;
pub mod system;

#[cfg(test)]
mod test_utils;

pub use adapter::{BackendPolicy, DeviceDriverAdapter, OpenPolicy};
pub use config::{AmdGpuConfig, HostCpuConfig, SchedulerMode, SystemConfig};
pub use device::{BackendKind, DeviceCapabilities, DeviceDescriptor, DeviceHandle, DeviceId};
pub use error::{HalError, SystemError};
pub use executable::{ArtifactId, ArtifactImage, ExecutableArtifact, LoadedRef};
pub use factory::SystemFactory;
pub use scheduler::{Completion, SchedulerError, SchedulerStats, TaskScheduler, WorkContext};
pub use system::{DeviceStatus, SkippedBackend, System, SystemReport, SystemState};
