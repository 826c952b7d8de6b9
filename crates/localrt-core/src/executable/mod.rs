//! Executable artifacts and the service that loads them onto devices.

pub mod artifact;
pub mod service;

pub use artifact::{ArtifactId, ArtifactImage, ExecutableArtifact, LoadedRef};
pub use service::ExecutableLoadingService;
