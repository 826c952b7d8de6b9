//! Error types for localrt-core.
//!
//! [`SystemError`] is what callers of the system manager see. [`HalError`]
//! is produced by driver bindings and plugin loaders and is mapped into a
//! `SystemError` by the adapter or service that observed it. Scheduler
//! errors live in [`crate::scheduler::SchedulerError`].

use crate::device::{BackendKind, DeviceId};
use crate::executable::ArtifactId;
use crate::scheduler::SchedulerError;
use crate::system::SystemState;
use thiserror::Error;

/// Errors returned by the system manager.
#[derive(Debug, Clone, Error)]
pub enum SystemError {
    /// Backend hardware or driver is absent. Recoverable for optional backends.
    #[error("Backend {kind} unavailable: {reason}")]
    BackendUnavailable { kind: BackendKind, reason: String },

    /// A present backend failed to open one device
    #[error("Failed to open device {device}: {reason}")]
    DeviceOpen { device: DeviceId, reason: String },

    /// No mandatory backend produced a usable device
    #[error("No usable backend: {0}")]
    NoUsableBackend(String),

    /// Artifact was built for a different backend than the target device
    #[error("Artifact '{artifact}' targets {artifact_kind} but device is {device_kind}")]
    BackendMismatch {
        artifact: ArtifactId,
        artifact_kind: BackendKind,
        device_kind: BackendKind,
    },

    /// The plugin loader rejected the artifact
    #[error("Failed to load artifact '{artifact}': {reason}")]
    LoadFailure { artifact: ArtifactId, reason: String },

    /// Operation invoked outside the `Ready` state
    #[error("Cannot {operation} while system is {state}")]
    InvalidState {
        operation: &'static str,
        state: SystemState,
    },

    /// Device id is not part of this system
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    /// Two descriptors claimed the same kind and ordinal
    #[error("Duplicate device: {0}")]
    DuplicateDevice(DeviceId),

    /// Configuration rejected before any backend was probed
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

impl SystemError {
    /// Whether the caller can keep using the system after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, SystemError::NoUsableBackend(_))
    }
}

impl From<SystemError> for String {
    fn from(err: SystemError) -> String {
        err.to_string()
    }
}

/// Errors reported by driver bindings and plugin loaders.
#[derive(Debug, Clone, Error)]
pub enum HalError {
    /// Driver library or hardware is missing
    #[error("Driver unavailable: {0}")]
    Unavailable(String),

    /// A driver entry point returned a failure code
    #[error("{call} failed with code {code}")]
    Call { call: &'static str, code: i32 },

    /// Handle or token was not produced by this driver
    #[error("Unknown handle: {0}")]
    UnknownHandle(u64),

    /// Executable image is malformed
    #[error("Invalid executable image: {0}")]
    InvalidImage(String),

    /// Executable image was built against another plugin ABI
    #[error("Unsupported plugin ABI version {found} (expected {expected})")]
    UnsupportedAbi { expected: u32, found: u32 },

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for HalError {
    fn from(err: std::io::Error) -> Self {
        HalError::Io(err.to_string())
    }
}
