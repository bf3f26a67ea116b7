//! Sandboxed file operations used by the `file_op` and `patch` tasks.
//!
//! Every path handed to [`SandboxedFs`] is relative to a fixed root.
//! Rules enforced before any I/O:
//! 1. Absolute paths and `..` components are rejected.
//! 2. The nearest existing ancestor of the target must resolve (through any
//!    symlinks) to a location inside the root.

use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::diff::{self, PatchError};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path traversal rejected: '{0}'")]
    PathTraversal(String),

    #[error("path escapes the sandbox: {}", .0.display())]
    OutsideSandbox(PathBuf),

    #[error("file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("file is not valid UTF-8: {}", .0.display())]
    NotUtf8(PathBuf),

    #[error("patch failed for {}: {source}", path.display())]
    Patch {
        path: PathBuf,
        #[source]
        source: PatchError,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    fn io(path: &Path, source: io::Error) -> Self {
        if source.kind() == io::ErrorKind::NotFound {
            Self::NotFound(path.to_path_buf())
        } else {
            Self::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// File operations collaborator consumed by the built-in tasks.
///
/// All paths are relative to the implementation's root.
#[async_trait]
pub trait FileOperations: Send + Sync {
    fn root(&self) -> &Path;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), FsError>;
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError>;
    async fn delete_file(&self, path: &str) -> Result<(), FsError>;
    async fn mkdir_all(&self, path: &str) -> Result<(), FsError>;
    async fn exists(&self, path: &str) -> Result<bool, FsError>;
    /// Hex-encoded SHA-256 of the file contents.
    async fn checksum(&self, path: &str) -> Result<String, FsError>;

    /// Unified diff from the file's current contents to `new_content`.
    /// A missing file diffs as empty.
    async fn generate_diff(&self, path: &str, new_content: &str) -> Result<String, FsError>;
    async fn apply_patch(&self, path: &str, diff: &str) -> Result<(), FsError>;
    /// Undo a previously applied `diff`.
    async fn reverse_patch(&self, path: &str, diff: &str) -> Result<(), FsError>;
}

// ---------------------------------------------------------------------------
// SandboxedFs
// ---------------------------------------------------------------------------

/// [`FileOperations`] confined to a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct SandboxedFs {
    root: PathBuf,
}

impl SandboxedFs {
    /// Create the root if needed and pin its canonical location.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, FsError> {
        let root = root.as_ref();
        std::fs::create_dir_all(root).map_err(|e| FsError::io(root, e))?;
        let root = std::fs::canonicalize(root).map_err(|e| FsError::io(root, e))?;
        Ok(Self { root })
    }

    /// Map a sandbox-relative path to an absolute one, rejecting escapes.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, FsError> {
        let requested = Path::new(path);
        let mut relative = PathBuf::new();

        for component in requested.components() {
            match component {
                Component::Normal(part) => relative.push(part),
                Component::CurDir => {}
                Component::ParentDir => return Err(FsError::PathTraversal(path.to_owned())),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::OutsideSandbox(requested.to_path_buf()))
                }
            }
        }

        if relative.as_os_str().is_empty() {
            return Err(FsError::InvalidPath(format!("'{path}' names no file")));
        }

        let full = self.root.join(relative);
        self.ensure_contained(&full)?;
        Ok(full)
    }

    fn ensure_contained(&self, full: &Path) -> Result<(), FsError> {
        let mut ancestor = Some(full);
        while let Some(candidate) = ancestor {
            match std::fs::symlink_metadata(candidate) {
                Ok(_) => {
                    // A dangling symlink cannot be canonicalized; treat it as an escape.
                    let real = std::fs::canonicalize(candidate)
                        .map_err(|_| FsError::OutsideSandbox(full.to_path_buf()))?;
                    if !real.starts_with(&self.root) {
                        return Err(FsError::OutsideSandbox(full.to_path_buf()));
                    }
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => ancestor = candidate.parent(),
                Err(e) => return Err(FsError::io(candidate, e)),
            }
        }
        Ok(())
    }

    async fn read_text_or_empty(&self, full: &Path) -> Result<String, FsError> {
        match tokio::fs::read(full).await {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| FsError::NotUtf8(full.to_path_buf())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(FsError::io(full, e)),
        }
    }

    async fn write_resolved(&self, full: &Path, content: &[u8]) -> Result<(), FsError> {
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::io(parent, e))?;
        }
        tokio::fs::write(full, content)
            .await
            .map_err(|e| FsError::io(full, e))
    }
}

#[async_trait]
impl FileOperations for SandboxedFs {
    fn root(&self) -> &Path {
        &self.root
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        self.write_resolved(&full, content).await?;
        debug!(path, bytes = content.len(), "wrote file");
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let full = self.resolve(path)?;
        tokio::fs::read(&full).await.map_err(|e| FsError::io(&full, e))
    }

    async fn delete_file(&self, path: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        tokio::fs::remove_file(&full)
            .await
            .map_err(|e| FsError::io(&full, e))?;
        debug!(path, "deleted file");
        Ok(())
    }

    async fn mkdir_all(&self, path: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        tokio::fs::create_dir_all(&full)
            .await
            .map_err(|e| FsError::io(&full, e))
    }

    async fn exists(&self, path: &str) -> Result<bool, FsError> {
        let full = self.resolve(path)?;
        tokio::fs::try_exists(&full)
            .await
            .map_err(|e| FsError::io(&full, e))
    }

    async fn checksum(&self, path: &str) -> Result<String, FsError> {
        let bytes = self.read_file(path).await?;
        Ok(format!("{:x}", Sha256::digest(&bytes)))
    }

    async fn generate_diff(&self, path: &str, new_content: &str) -> Result<String, FsError> {
        let full = self.resolve(path)?;
        let current = self.read_text_or_empty(&full).await?;
        Ok(diff::generate(path, &current, new_content))
    }

    async fn apply_patch(&self, path: &str, diff: &str) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        let current = self.read_text_or_empty(&full).await?;
        let patched = diff::apply(&current, diff).map_err(|source| FsError::Patch {
            path: full.clone(),
            source,
        })?;
        self.write_resolved(&full, patched.as_bytes()).await?;
        debug!(path, "applied patch");
        Ok(())
    }

    async fn reverse_patch(&self, path: &str, diff: &str) -> Result<(), FsError> {
        let reversed = diff::reverse(diff).map_err(|source| FsError::Patch {
            path: self.root.join(path),
            source,
        })?;
        self.apply_patch(path, &reversed).await
    }
}
