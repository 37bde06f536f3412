//! Directory-backed artifact store keyed by model name and representation.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

use super::atomic::{atomic_copy_file, atomic_replace_dir, atomic_write_bytes};
use crate::artifact::{ArtifactLocation, ModelArtifact, Representation};
use crate::config::PathsConfig;
use crate::error::IoResultExt;
use crate::{ConvertError, Result};

/// A directory holding at most one artifact per `(representation, name)`.
///
/// Writers must be exclusive per name; [`ArtifactStore::lock`] enforces that
/// across processes.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root).with_path(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location an artifact of `representation` named `name` lives at.
    pub fn path_for(&self, representation: Representation, name: &str) -> PathBuf {
        self.root.join(representation.file_name(name))
    }

    pub fn exists(&self, representation: Representation, name: &str) -> bool {
        validate_name(name).is_ok() && self.path_for(representation, name).exists()
    }

    /// Load the stored artifact, or fail with `ArtifactNotFound`.
    pub fn read(&self, representation: Representation, name: &str) -> Result<ModelArtifact> {
        validate_name(name)?;
        let path = self.path_for(representation, name);
        if !path.exists() {
            return Err(ConvertError::ArtifactNotFound {
                name: name.to_string(),
                representation: representation.to_string(),
            });
        }
        ModelArtifact::from_path(representation, path)
    }

    /// Store `artifact` under `name`, replacing any previous one atomically.
    ///
    /// Returns the path the artifact is now visible at.
    pub fn write(&self, artifact: &ModelArtifact, name: &str) -> Result<PathBuf> {
        validate_name(name)?;
        let representation = artifact.representation();
        let dest = self.path_for(representation, name);

        match artifact.location() {
            ArtifactLocation::Memory(data) => atomic_write_bytes(&dest, data)?,
            ArtifactLocation::Path(src) if same_file(src, &dest) => {
                debug!("{} already stored at {}", representation, dest.display());
            }
            ArtifactLocation::Path(src) if representation.is_directory() => {
                atomic_replace_dir(src, &dest)?
            }
            ArtifactLocation::Path(src) => atomic_copy_file(src, &dest)?,
        }

        info!(
            representation = %representation,
            size_bytes = artifact.size_bytes(),
            "Stored {} at {}",
            name,
            dest.display()
        );
        Ok(dest)
    }

    /// Delete the stored artifact. Returns `false` if there was nothing to delete.
    pub fn remove(&self, representation: Representation, name: &str) -> Result<bool> {
        validate_name(name)?;
        let path = self.path_for(representation, name);
        let result = if representation.is_directory() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };

        match result {
            Ok(()) => {
                debug!("Removed {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(ConvertError::io("removing artifact", path, e)),
        }
    }

    /// Every representation currently stored for `name`.
    pub fn list(&self, name: &str) -> Result<Vec<ModelArtifact>> {
        validate_name(name)?;
        Representation::ALL
            .iter()
            .filter(|r| self.exists(**r, name))
            .map(|r| self.read(*r, name))
            .collect()
    }

    /// Take the exclusive per-name writer lock, failing fast if it is held.
    pub fn lock(&self, name: &str) -> Result<StoreLock> {
        validate_name(name)?;
        let dir = self.root.join(PathsConfig::LOCKS_DIR_NAME);
        fs::create_dir_all(&dir).with_path(&dir)?;

        let path = dir.join(format!("{name}.lock"));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_path(&path)?;

        file.try_lock_exclusive().map_err(|_| ConvertError::StoreBusy {
            name: name.to_string(),
        })?;

        debug!("Locked {}", path.display());
        Ok(StoreLock { file, path })
    }
}

/// Held for the duration of a run; released on drop.
#[derive(Debug)]
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            debug!("Failed to unlock {}: {}", self.path.display(), e);
        }
    }
}

/// Model names become file names, so they must be a single plain path component.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(ConvertError::Validation {
            field: "name".into(),
            message: format!("'{name}' is not a valid model name"),
        });
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
