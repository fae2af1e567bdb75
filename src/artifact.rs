//! Secure artifact retrieval.
//!
//! Resolves a client-supplied path to a file strictly inside the scratch
//! root. The order of checks matters:
//!
//! 1. reject anything that does not name a `.gcode` file
//! 2. canonicalize the requested path (anchored under the root when relative)
//! 3. check the canonical path is contained in the canonical root
//! 4. only then stat it as a regular file and read it
//!
//! Canonicalizing before the containment check is what defeats symlinks
//! planted inside the root. Every failure collapses to [`ArtifactNotFound`].

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{ArtifactNotFound, WorkspaceError};

/// Extension (without the dot) every servable artifact carries.
pub const ARTIFACT_EXTENSION: &str = "gcode";

/// Read-only view of the artifacts under one scratch root.
#[derive(Debug, Clone)]
pub struct ArtifactReader {
    root: PathBuf,
}

impl ArtifactReader {
    /// Canonicalize the root once up front.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, WorkspaceError> {
        let root = root.as_ref();
        let canonical = tokio::fs::canonicalize(root)
            .await
            .map_err(|source| WorkspaceError::Canonicalize {
                path: root.to_path_buf(),
                source,
            })?;
        Ok(Self { root: canonical })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `requested` to a canonical path inside the root that names an
    /// existing regular artifact file.
    pub async fn resolve(&self, requested: impl AsRef<Path>) -> Result<PathBuf, ArtifactNotFound> {
        let requested = requested.as_ref();
        if !has_artifact_extension(requested) {
            debug!("Artifact rejected: extension");
            return Err(ArtifactNotFound);
        }

        let anchored = if requested.is_absolute() {
            requested.to_path_buf()
        } else {
            self.root.join(requested)
        };

        let canonical = tokio::fs::canonicalize(&anchored).await.map_err(|e| {
            debug!(error = %e, "Artifact rejected: unresolvable");
            ArtifactNotFound
        })?;

        // A link named `x.gcode` must not expose some other kind of file.
        if !is_contained(&self.root, &canonical) || !has_artifact_extension(&canonical) {
            debug!("Artifact rejected: outside scratch root");
            return Err(ArtifactNotFound);
        }

        match tokio::fs::metadata(&canonical).await {
            Ok(meta) if meta.is_file() => Ok(canonical),
            _ => {
                debug!("Artifact rejected: not a regular file");
                Err(ArtifactNotFound)
            }
        }
    }

    /// Read the bytes of the artifact named by `requested`.
    pub async fn read(&self, requested: impl AsRef<Path>) -> Result<Vec<u8>, ArtifactNotFound> {
        let path = self.resolve(requested).await?;
        tokio::fs::read(&path).await.map_err(|e| {
            debug!(error = %e, "Artifact read failed");
            ArtifactNotFound
        })
    }
}

fn has_artifact_extension(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == ARTIFACT_EXTENSION)
}

/// Lexical containment of an already canonical `candidate` in the canonical
/// `root`. The root itself does not count as contained.
pub fn is_contained(root: &Path, candidate: &Path) -> bool {
    let Ok(relative) = candidate.strip_prefix(root) else {
        return false;
    };
    let mut components = relative.components().peekable();
    if components.peek().is_none() {
        return false;
    }
    components.all(|c| matches!(c, Component::Normal(_)))
}
