//! Atomic file operations.
//!
//! Every write follows the same discipline:
//! 1. Stage the full content next to the target (same filesystem)
//! 2. fsync the staged data
//! 3. Rename the staged entry over the target
//!
//! A reader of the target path therefore sees either the previous content or
//! the new content, never a partial file.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::PathsConfig;
use crate::error::IoResultExt;
use crate::{ConvertError, Result};

/// Read and parse a JSON file.
///
/// Returns `None` if the file doesn't exist, or an error if parsing fails.
pub fn atomic_read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let mut contents = String::new();
    File::open(path)
        .and_then(|mut f| f.read_to_string(&mut contents))
        .with_path(path)?;

    let data: T = serde_json::from_str(&contents).map_err(|e| ConvertError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(data))
}

/// Serialize `data` as pretty JSON and write it atomically.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<()> {
    let serialized = serde_json::to_vec_pretty(data).map_err(|e| ConvertError::Json {
        message: format!("Failed to serialize data: {}", e),
        source: Some(e),
    })?;
    atomic_write_bytes(path, &serialized)
}

/// Write `data` to `path` atomically.
pub fn atomic_write_bytes(path: &Path, data: &[u8]) -> Result<()> {
    let mut staged = stage_file(path)?;
    staged.write_all(data).with_path(staged.path().to_path_buf())?;
    commit_file(staged, path)
}

/// Copy the file at `src` over `dest` atomically.
pub fn atomic_copy_file(src: &Path, dest: &Path) -> Result<()> {
    let mut staged = stage_file(dest)?;
    let mut reader = File::open(src).with_path(src)?;
    io::copy(&mut reader, &mut staged).with_path(staged.path().to_path_buf())?;
    commit_file(staged, dest)
}

/// Replace the directory at `dest` with a copy of `src`.
///
/// The copy is staged completely before `dest` is touched. An existing `dest`
/// is renamed aside, the staged copy renamed in, and the old tree removed.
/// If the second rename fails the old tree is moved back.
pub fn atomic_replace_dir(src: &Path, dest: &Path) -> Result<()> {
    let parent = parent_dir(dest)?;
    let staging = parent.join(format!(
        "{}{}",
        PathsConfig::STAGING_PREFIX,
        uuid::Uuid::new_v4().simple()
    ));

    if let Err(e) = copy_tree(src, &staging) {
        fs::remove_dir_all(&staging).ok();
        return Err(e);
    }

    let displaced = if dest.exists() {
        let aside = parent.join(format!(
            "{}old-{}",
            PathsConfig::STAGING_PREFIX,
            uuid::Uuid::new_v4().simple()
        ));
        if let Err(e) = fs::rename(dest, &aside) {
            fs::remove_dir_all(&staging).ok();
            return Err(ConvertError::io("moving previous directory aside", dest, e));
        }
        Some(aside)
    } else {
        None
    };

    if let Err(e) = fs::rename(&staging, dest) {
        if let Some(aside) = &displaced {
            if let Err(restore) = fs::rename(aside, dest) {
                warn!("Failed to restore {}: {}", dest.display(), restore);
            }
        }
        fs::remove_dir_all(&staging).ok();
        return Err(ConvertError::io("renaming staged directory", dest, e));
    }

    if let Some(aside) = displaced {
        if let Err(e) = fs::remove_dir_all(&aside) {
            warn!("Failed to remove replaced directory {}: {}", aside.display(), e);
        }
    }

    debug!("Atomically replaced {}", dest.display());
    Ok(())
}

fn parent_dir(path: &Path) -> Result<PathBuf> {
    let parent = path.parent().ok_or_else(|| ConvertError::Validation {
        field: "path".into(),
        message: format!("{} has no parent directory", path.display()),
    })?;
    if !parent.exists() {
        fs::create_dir_all(parent).with_path(parent)?;
    }
    Ok(parent.to_path_buf())
}

/// Create a temp file in the target's directory so the final rename stays on one filesystem.
fn stage_file(target: &Path) -> Result<NamedTempFile> {
    let parent = parent_dir(target)?;
    tempfile::Builder::new()
        .prefix(PathsConfig::STAGING_PREFIX)
        .suffix(".tmp")
        .tempfile_in(&parent)
        .map_err(|e| ConvertError::io("creating staging file", &parent, e))
}

fn commit_file(mut staged: NamedTempFile, target: &Path) -> Result<()> {
    staged
        .flush()
        .and_then(|_| staged.as_file().sync_all())
        .with_path(staged.path().to_path_buf())?;

    staged
        .persist(target)
        .map_err(|e| ConvertError::io("renaming staged file", target, e.error))?;

    debug!("Atomically wrote {}", target.display());
    Ok(())
}

fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| ConvertError::Io {
            message: format!("walking {}: {}", src.display(), e),
            path: Some(src.to_path_buf()),
            source: e.into_io_error(),
        })?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|_| ConvertError::Validation {
                field: "path".into(),
                message: format!("{} escapes {}", entry.path().display(), src.display()),
            })?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).with_path(&target)?;
        } else {
            fs::copy(entry.path(), &target).with_path(&target)?;
            File::open(&target)
                .and_then(|f| f.sync_all())
                .with_path(&target)?;
        }
    }
    Ok(())
}
