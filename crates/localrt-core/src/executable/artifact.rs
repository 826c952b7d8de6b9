//! Executable artifacts and residency references.

use crate::device::{BackendKind, DeviceId};
use crate::error::HalError;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;

/// Identity of an executable artifact. At most one residency per identity.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId(String);

impl ArtifactId {
    pub fn new(id: impl Into<String>) -> Self {
        ArtifactId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ArtifactId {
    fn from(id: &str) -> Self {
        ArtifactId::new(id)
    }
}

/// Compiled executable image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArtifactImage {
    /// Image held in memory
    Bytes(Vec<u8>),
    /// Image stored on disk, read when loaded
    File(PathBuf),
}

impl ArtifactImage {
    /// Returns the image contents, reading the file if needed.
    pub fn bytes(&self) -> Result<Cow<'_, [u8]>, HalError> {
        match self {
            ArtifactImage::Bytes(bytes) => Ok(Cow::Borrowed(bytes)),
            ArtifactImage::File(path) => std::fs::read(path)
                .map(Cow::Owned)
                .map_err(|e| HalError::Io(format!("{}: {}", path.display(), e))),
        }
    }
}

/// Compiled code targeting one backend kind.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutableArtifact {
    pub id: ArtifactId,
    pub kind: BackendKind,
    pub image: ArtifactImage,
}

impl ExecutableArtifact {
    pub fn from_bytes(id: impl Into<String>, kind: BackendKind, bytes: Vec<u8>) -> Self {
        Self {
            id: ArtifactId::new(id),
            kind,
            image: ArtifactImage::Bytes(bytes),
        }
    }

    pub fn from_file(id: impl Into<String>, kind: BackendKind, path: impl Into<PathBuf>) -> Self {
        Self {
            id: ArtifactId::new(id),
            kind,
            image: ArtifactImage::File(path.into()),
        }
    }
}

/// Reference to one residency of an artifact on a device.
///
/// A reference becomes stale when the same identity is loaded again;
/// unloading a stale reference does nothing.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct LoadedRef {
    artifact: ArtifactId,
    device: DeviceId,
    generation: u64,
}

impl LoadedRef {
    pub(crate) fn new(artifact: ArtifactId, device: DeviceId, generation: u64) -> Self {
        Self {
            artifact,
            device,
            generation,
        }
    }

    pub fn artifact(&self) -> &ArtifactId {
        &self.artifact
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }
}
