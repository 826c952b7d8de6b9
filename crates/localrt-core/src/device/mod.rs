//! Device identities, descriptors and opened handles.

pub mod handle;
pub mod types;

pub use handle::DeviceHandle;
pub use types::{BackendKind, DeviceCapabilities, DeviceDescriptor, DeviceId};
